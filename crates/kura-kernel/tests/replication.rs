//! Two engines exchanging frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use kura_kernel::{Kura, Record};

async fn engine() -> Kura {
    let kura = Kura::in_memory().await.unwrap();
    kura.ready().await;
    kura
}

fn listing(kura: &Kura, dir: &str) -> Vec<String> {
    kura.listdir(Some(dir)).unwrap_or_default()
}

#[tokio::test]
async fn test_changes_replicate_to_peer() {
    let a = engine().await;
    let b = engine().await;

    a.mkdir("/docs").unwrap();
    a.write_file("/docs/f", "shared text", None).await.unwrap();
    let frame = a.produce_frame(None).unwrap();

    let report = b.push_rx(&frame).await;
    assert_eq!(report.blocks, 1);
    assert_eq!(report.upserts, 2);
    assert_eq!(b.read_file("/docs/f").await.unwrap().text().unwrap(), "shared text");

    // Merged records are not queued again
    assert_eq!(b.pending_tx(), 0);

    a.rm("/docs/f").unwrap();
    let frame = a.produce_frame(None).unwrap();
    let report = b.push_rx(&frame).await;
    assert_eq!(report.deletions, 1);
    assert!(!b.is_file("/docs/f"));
    assert!(b.is_dir("/docs"));
}

#[tokio::test]
async fn test_merge_order_does_not_matter() {
    let a = engine().await;
    a.mkdir("/d").unwrap();
    a.write_file("/d/f", "short lived", None).await.unwrap();
    let created = a.produce_frame(None).unwrap();
    a.rm("/d/f").unwrap();
    let deleted = a.produce_frame(None).unwrap();

    let in_order = engine().await;
    in_order.push_rx(&created).await;
    in_order.push_rx(&deleted).await;

    let reversed = engine().await;
    reversed.push_rx(&deleted).await;
    let report = reversed.push_rx(&created).await;
    // The directory and block land, the file stays deleted
    assert_eq!(report.upserts, 1);
    assert_eq!(report.blocks, 1);
    assert_eq!(report.ignored, 1);

    assert_eq!(listing(&in_order, "/d"), listing(&reversed, "/d"));
    assert!(listing(&reversed, "/d").is_empty());
    assert!(!reversed.is_file("/d/f"));
}

#[tokio::test]
async fn test_child_frame_ahead_of_parent_frame() {
    let a = engine().await;
    a.mkdir("/d").unwrap();
    let parent = a.produce_frame(None).unwrap();
    a.mkdir("/d/e").unwrap();
    let child = a.produce_frame(None).unwrap();

    let b = engine().await;
    let report = b.push_rx(&child).await;
    assert_eq!(report.upserts, 1);
    let report = b.push_rx(&parent).await;
    assert_eq!(report.upserts, 1);

    assert!(b.is_dir("/d"));
    assert!(b.is_dir("/d/e"));
    assert_eq!(listing(&b, "/d"), vec!["e"]);
}

#[tokio::test]
async fn test_received_blocks_outlive_one_collection() {
    let b = engine().await;
    let chunk: Arc<[u8]> = Arc::from(&b"inode still in flight"[..]);
    let digest = b.blocks().digest(&chunk);
    let frame = Record::Block {
        digest: digest.clone(),
        chunk,
    }
    .encode()
    .unwrap();

    assert_eq!(b.push_rx(&frame).await.blocks, 1);

    // The first pass spares it, the next one collects it
    let report = b.deduplicate().await.unwrap().unwrap();
    assert!(report.removed.is_empty());
    assert!(b.blocks().contains(&digest));

    let report = b.deduplicate().await.unwrap().unwrap();
    assert_eq!(report.removed, vec![digest.clone()]);
    assert!(!b.blocks().contains(&digest));
}

#[tokio::test]
async fn test_stale_upserts_are_ignored() {
    let a = engine().await;
    let b = engine().await;

    a.write_file("/f", "from a", None).await.unwrap();
    let frame = a.produce_frame(None).unwrap();
    b.push_rx(&frame).await;

    // b has seen a's timestamps, so its own write is strictly newer
    b.write_file("/f", "from b", None).await.unwrap();
    let report = b.push_rx(&frame).await;
    assert_eq!(report.upserts, 0);
    assert_eq!(b.read_file("/f").await.unwrap().text().unwrap(), "from b");
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let a = engine().await;
    let b = engine().await;
    a.mkdir("/ok").unwrap();
    let frame = a.produce_frame(None).unwrap();

    let report = b.push_rx(&format!("not-base64!|{frame}|")).await;
    assert_eq!(report.ignored, 1);
    assert_eq!(report.upserts, 1);
    assert!(b.is_dir("/ok"));
}

#[tokio::test]
async fn test_universes_replicate() {
    let a = engine().await;
    let b = engine().await;
    a.write_file("/f", "base", None).await.unwrap();
    a.clone_universe("/", "copy").unwrap();

    while let Some(frame) = a.produce_frame(Some(64)) {
        b.push_rx(&frame).await;
    }
    assert_eq!(b.list_universes(), vec!["/".to_string(), "@copy".to_string()]);
    assert_eq!(b.read_file("@copy/f").await.unwrap().text().unwrap(), "base");
}

#[tokio::test]
async fn test_snapshot_rebuilds_a_fresh_peer() {
    let a = engine().await;
    a.mkdir("/x").unwrap();
    a.mkdir("/x/y").unwrap();
    a.write_file("/x/y/z", "deep", None).await.unwrap();
    a.write_file("/gone", "bye", None).await.unwrap();
    a.rm("/gone").unwrap();

    let b = engine().await;
    for frame in a.snapshot_frames(Some(100)).await.unwrap() {
        b.push_rx(&frame).await;
    }
    assert_eq!(b.read_file("/x/y/z").await.unwrap().text().unwrap(), "deep");
    assert!(!b.is_file("/gone"));
}

#[tokio::test]
async fn test_tx_producer_retries_failed_sends() {
    let a = engine().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    a.add_tx(
        move |frame| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("link down");
            }
            tx.send(frame).map_err(|_| anyhow::anyhow!("receiver gone"))
        },
        Some(Duration::from_millis(10)),
        None,
    );

    a.mkdir("/x").unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(attempts.load(Ordering::SeqCst) >= 2);

    let b = engine().await;
    b.push_rx(&frame).await;
    assert!(b.is_dir("/x"));

    a.stop_tx();
    assert_eq!(a.pending_tx(), 0);
}
