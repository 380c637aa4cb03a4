//! Content-addressable block storage.
//!
//! Blocks are immutable chunks keyed by the digest of their content. The store
//! keeps an in-memory key-set mirroring the backend: it is populated by
//! enumeration at open and updated on every put and delete, so existence checks
//! never touch the backend.
//!
//! # Garbage collection
//!
//! [`BlockStore::collect_garbage`] is a mark-and-sweep pass. Every known key is
//! a candidate; the caller-supplied mark step returns the set of keys still
//! referenced; everything else is deleted. Only one pass runs at a time: a
//! request made while a pass is active returns `Ok(None)` without queuing.
//!
//! Writers hold [`BlockStore::write_gate`] from the moment they dedupe against
//! the key-set until their referencing inode is visible, and a sweep holds the
//! gate exclusively, so a sweep never deletes a block a writer is about to
//! reference.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::digest::{ContentHasher, Digest};
use crate::error::{CasError, CasResult};
use crate::store::KvStore;

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys known when the pass started.
    pub scanned: usize,
    /// Keys found referenced by the mark step.
    pub referenced: usize,
    /// Keys deleted, in sorted order.
    pub removed: Vec<Digest>,
}

/// Resets the in-flight flag when a sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Deduplicating block store over a [`KvStore`].
pub struct BlockStore {
    store: Arc<dyn KvStore>,
    hasher: Arc<dyn ContentHasher>,
    keys: RwLock<HashSet<Digest>>,
    sweeping: AtomicBool,
    gate: tokio::sync::RwLock<()>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &self.len())
            .field("sweeping", &self.is_sweeping())
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Open a block store, populating the key-set from the backend.
    pub async fn open(store: Arc<dyn KvStore>, hasher: Arc<dyn ContentHasher>) -> CasResult<Self> {
        let keys: HashSet<Digest> = store.keys().await?.into_iter().collect();
        debug!(blocks = keys.len(), "block store opened");
        Ok(Self {
            store,
            hasher,
            keys: RwLock::new(keys),
            sweeping: AtomicBool::new(false),
            gate: tokio::sync::RwLock::new(()),
        })
    }

    /// Digest a chunk with this store's hasher.
    pub fn digest(&self, chunk: &[u8]) -> Digest {
        self.hasher.digest(chunk)
    }

    /// The hasher blocks are addressed with.
    pub fn hasher(&self) -> &Arc<dyn ContentHasher> {
        &self.hasher
    }

    /// Check the key-set for a block.
    pub fn contains(&self, digest: &str) -> bool {
        self.keys.read().contains(digest)
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns true if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Snapshot of every stored key, sorted.
    pub fn keys(&self) -> Vec<Digest> {
        let mut keys: Vec<Digest> = self.keys.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns true while a garbage collection pass is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Shared side of the writer/sweeper gate.
    pub async fn write_gate(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Store a chunk under `digest` unless it is already present.
    ///
    /// Returns `true` if the chunk was novel and written.
    pub async fn put(&self, digest: &str, chunk: &[u8]) -> CasResult<bool> {
        if self.contains(digest) {
            return Ok(false);
        }
        self.store.put(digest, chunk.to_vec()).await?;
        self.keys.write().insert(digest.to_string());
        Ok(true)
    }

    /// Digest and store a chunk. Returns the digest and whether it was novel.
    pub async fn insert(&self, chunk: &[u8]) -> CasResult<(Digest, bool)> {
        let digest = self.digest(chunk);
        let novel = self.put(&digest, chunk).await?;
        Ok((digest, novel))
    }

    /// Fetch one block.
    pub async fn get(&self, digest: &str) -> CasResult<Option<Vec<u8>>> {
        if !self.contains(digest) {
            return Ok(None);
        }
        self.store.get(digest).await
    }

    /// Concatenate the given blocks in order.
    ///
    /// Fails with [`CasError::MissingBlock`] before reading anything if any
    /// block is unknown.
    pub async fn read_many(&self, digests: &[Digest]) -> CasResult<Vec<u8>> {
        if let Some(missing) = digests.iter().find(|d| !self.contains(d)) {
            return Err(CasError::MissingBlock(missing.clone()));
        }

        let mut data = Vec::new();
        for digest in digests {
            match self.store.get(digest).await? {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => return Err(CasError::MissingBlock(digest.clone())),
            }
        }
        Ok(data)
    }

    /// Delete a block. Returns `true` if it existed.
    pub async fn delete(&self, digest: &str) -> CasResult<bool> {
        if !self.contains(digest) {
            return Ok(false);
        }
        self.store.delete(digest).await?;
        self.keys.write().remove(digest);
        Ok(true)
    }

    /// Run one mark-and-sweep pass.
    ///
    /// `mark` is called once, after the candidate set is seeded, and must
    /// return every digest still referenced. Returns `Ok(None)` if another
    /// pass is already in flight.
    pub async fn collect_garbage<F>(&self, mark: F) -> CasResult<Option<SweepReport>>
    where
        F: FnOnce() -> HashSet<Digest>,
    {
        let Some(_guard) = SweepGuard::acquire(&self.sweeping) else {
            debug!("garbage collection already running, skipping");
            return Ok(None);
        };
        let _gate = self.gate.write().await;

        let mut garbage: HashSet<Digest> = self.keys.read().clone();
        let scanned = garbage.len();
        let referenced = mark();
        garbage.retain(|digest| !referenced.contains(digest));

        let mut removed: Vec<Digest> = garbage.into_iter().collect();
        removed.sort();
        for digest in &removed {
            self.store.delete(digest).await?;
            self.keys.write().remove(digest);
        }

        if !removed.is_empty() {
            info!(scanned, removed = removed.len(), "garbage collection reclaimed blocks");
        }
        Ok(Some(SweepReport {
            scanned,
            referenced: scanned - removed.len(),
            removed,
        }))
    }
}
