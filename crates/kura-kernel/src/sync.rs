//! Replication wire format and outbound queue.
//!
//! Peers exchange *frames*: records joined with `|`. Each record is a JSON
//! object encoded as standard base64 (whose alphabet never contains `|`):
//!
//! ```text
//! {"block": "<digest>", "chunk": "<base64 bytes>"}
//! {"path": "/a", "type": "file", "cdate": 1, "mdate": 2, "size": 3, "blocks": [...], "mime": "..."}
//! {"path": "/a", "type": "dir", "cdate": 1, "mdate": 2}
//! {"path": "/a", "type": "tombstone", "ctime": 5, "mtime": 5}
//! ```
//!
//! Only locally originated storage events are queued, so merged records are
//! never echoed back to the peer they came from.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use kura_cas::Digest;

use crate::flows::{FsEvent, OpSource};
use crate::vfs::{Inode, Tombstone};

/// Separator between records in a frame.
pub const RECORD_SEPARATOR: char = '|';

/// Why a record could not be decoded.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("bad json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unrecognized record: {0}")]
    Shape(String),
}

/// One replicated change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Block content.
    Block { digest: Digest, chunk: Arc<[u8]> },
    /// Inode creation or replacement.
    Upsert { path: String, inode: Inode },
    /// Inode deletion.
    Tombstone { path: String, tombstone: Tombstone },
}

impl Record {
    /// The record announcing a storage event, if it is one.
    pub fn from_event(event: &FsEvent) -> Option<Self> {
        match event {
            FsEvent::WriteBlock { digest, chunk, .. } => Some(Record::Block {
                digest: digest.clone(),
                chunk: chunk.clone(),
            }),
            FsEvent::WriteInode { path, inode, .. } => Some(Record::Upsert {
                path: path.clone(),
                inode: inode.clone(),
            }),
            FsEvent::DeleteInode { path, tombstone, .. } => Some(Record::Tombstone {
                path: path.clone(),
                tombstone: *tombstone,
            }),
            _ => None,
        }
    }

    fn to_json(&self) -> Result<Value, WireError> {
        let mut obj = Map::new();
        match self {
            Record::Block { digest, chunk } => {
                obj.insert("block".into(), Value::String(digest.clone()));
                obj.insert("chunk".into(), Value::String(STANDARD.encode(chunk)));
            }
            Record::Upsert { path, inode } => {
                if let Value::Object(fields) = serde_json::to_value(inode)? {
                    obj = fields;
                }
                obj.insert("path".into(), Value::String(path.clone()));
            }
            Record::Tombstone { path, tombstone } => {
                obj.insert("path".into(), Value::String(path.clone()));
                obj.insert("type".into(), Value::String("tombstone".into()));
                obj.insert("ctime".into(), tombstone.ctime.into());
                obj.insert("mtime".into(), tombstone.mtime.into());
            }
        }
        Ok(Value::Object(obj))
    }

    /// Encode as one wire record.
    pub fn encode(&self) -> Result<String, WireError> {
        let json = serde_json::to_vec(&self.to_json()?)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode one wire record.
    pub fn decode(record: &str) -> Result<Self, WireError> {
        let bytes = STANDARD.decode(record.trim())?;
        let mut value: Value = serde_json::from_slice(&bytes)?;
        let Some(obj) = value.as_object_mut() else {
            return Err(WireError::Shape("not an object".into()));
        };

        if let Some(Value::String(digest)) = obj.get("block") {
            let Some(Value::String(chunk)) = obj.get("chunk") else {
                return Err(WireError::Shape("block record without chunk".into()));
            };
            return Ok(Record::Block {
                digest: digest.clone(),
                chunk: STANDARD.decode(chunk)?.into(),
            });
        }

        let Some(Value::String(path)) = obj.remove("path") else {
            return Err(WireError::Shape("record without block or path".into()));
        };
        let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("tombstone") => {
                let tombstone: Tombstone = serde_json::from_value(value)?;
                Ok(Record::Tombstone { path, tombstone })
            }
            Some("file") | Some("dir") => {
                let inode: Inode = serde_json::from_value(value)?;
                Ok(Record::Upsert { path, inode })
            }
            other => Err(WireError::Shape(format!("unknown record type {other:?}"))),
        }
    }
}

/// Split a frame into its raw records, skipping empty ones.
pub fn split_frame(frame: &str) -> impl Iterator<Item = &str> {
    frame.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

/// Counts from merging one inbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Novel blocks stored.
    pub blocks: usize,
    /// Upserts applied.
    pub upserts: usize,
    /// Tombstones that deleted something.
    pub deletions: usize,
    /// Records dropped as malformed, stale or already known.
    pub ignored: usize,
}

impl MergeReport {
    /// Returns true if the frame changed anything.
    pub fn changed(&self) -> bool {
        self.blocks + self.upserts + self.deletions > 0
    }
}

/// Outbound FIFO of encoded records.
#[derive(Debug, Default)]
pub struct TxQueue {
    records: Mutex<VecDeque<String>>,
}

impl TxQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the record for a storage event, if the event is local.
    pub fn offer(&self, event: &FsEvent) {
        if event.source() == OpSource::Remote {
            return;
        }
        let Some(record) = Record::from_event(event) else {
            return;
        };
        match record.encode() {
            Ok(encoded) => self.records.lock().push_back(encoded),
            Err(e) => tracing::error!(error = %e, "failed to encode replication record"),
        }
    }

    /// Queue an already encoded record.
    pub fn push(&self, encoded: String) {
        self.records.lock().push_back(encoded);
    }

    /// Put the records of an unsent frame back at the front of the queue.
    pub fn requeue(&self, frame: &str) {
        let mut records = self.records.lock();
        let parts: Vec<&str> = split_frame(frame).collect();
        for record in parts.into_iter().rev() {
            records.push_front(record.to_string());
        }
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Pop records into a frame of at most `budget` bytes.
    ///
    /// A record that does not fit goes back to the front of the queue. A
    /// record larger than the whole budget is never split: it travels alone.
    pub fn produce_frame(&self, budget: usize) -> Option<String> {
        let mut records = self.records.lock();
        let mut frame = String::new();

        while let Some(record) = records.pop_front() {
            let needed = if frame.is_empty() {
                record.len()
            } else {
                frame.len() + 1 + record.len()
            };
            if needed > budget && !frame.is_empty() {
                records.push_front(record);
                break;
            }
            if !frame.is_empty() {
                frame.push(RECORD_SEPARATOR);
            }
            frame.push_str(&record);
            if needed >= budget {
                break;
            }
        }

        (!frame.is_empty()).then_some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(path: &str, mdate: i64) -> Record {
        Record::Upsert {
            path: path.into(),
            inode: Inode::file(1, mdate, 2, vec!["d1".into()], "text/plain", Some(512)),
        }
    }

    #[test]
    fn test_record_wire_shapes() {
        let block = Record::Block {
            digest: "abc".into(),
            chunk: Arc::from(&b"hi"[..]),
        };
        let json = block.to_json().unwrap();
        assert_eq!(json["block"], "abc");
        assert_eq!(json["chunk"], "aGk=");

        let json = upsert("/f", 2).to_json().unwrap();
        assert_eq!(json["path"], "/f");
        assert_eq!(json["type"], "file");
        assert_eq!(json["mdate"], 2);

        let tomb = Record::Tombstone {
            path: "/f".into(),
            tombstone: Tombstone { ctime: 3, mtime: 4 },
        };
        let json = tomb.to_json().unwrap();
        assert_eq!(json["type"], "tombstone");
        assert_eq!(json["mtime"], 4);
    }

    #[test]
    fn test_decode_each_kind() {
        for record in [
            upsert("@u/f", 7),
            Record::Upsert {
                path: "/d".into(),
                inode: Inode::dir(1, 2),
            },
            Record::Tombstone {
                path: "/gone".into(),
                tombstone: Tombstone::at(9),
            },
            Record::Block {
                digest: "abc".into(),
                chunk: Arc::from(&[0u8, 255, 124][..]),
            },
        ] {
            let encoded = record.encode().unwrap();
            assert!(!encoded.contains(RECORD_SEPARATOR));
            assert_eq!(Record::decode(&encoded).unwrap(), record);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Record::decode("!!!"), Err(WireError::Base64(_))));
        let not_json = STANDARD.encode("nope");
        assert!(matches!(Record::decode(&not_json), Err(WireError::Json(_))));
        let wrong = STANDARD.encode(r#"{"path":"/a","type":"socket"}"#);
        assert!(matches!(Record::decode(&wrong), Err(WireError::Shape(_))));
        let bare = STANDARD.encode("[1,2]");
        assert!(matches!(Record::decode(&bare), Err(WireError::Shape(_))));
    }

    #[test]
    fn test_queue_skips_remote_and_non_storage_events() {
        let queue = TxQueue::new();
        queue.offer(&FsEvent::CreateDir {
            path: "/a".into(),
            source: OpSource::Local,
        });
        queue.offer(&FsEvent::WriteInode {
            path: "/a".into(),
            inode: Inode::dir(1, 1),
            source: OpSource::Remote,
        });
        assert!(queue.is_empty());

        queue.offer(&FsEvent::WriteInode {
            path: "/a".into(),
            inode: Inode::dir(1, 1),
            source: OpSource::Local,
        });
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_frames_respect_budget_and_order() {
        let queue = TxQueue::new();
        for r in ["aaaa", "bbbb", "cccc", "dddd", "eeee"] {
            queue.push(r.to_string());
        }

        assert_eq!(queue.produce_frame(10).as_deref(), Some("aaaa|bbbb"));
        assert_eq!(queue.produce_frame(14).as_deref(), Some("cccc|dddd|eeee"));
        assert_eq!(queue.produce_frame(14), None);
    }

    #[test]
    fn test_requeue_restores_order() {
        let queue = TxQueue::new();
        for r in ["a", "b", "c"] {
            queue.push(r.to_string());
        }
        let frame = queue.produce_frame(3).unwrap();
        assert_eq!(frame, "a|b");
        queue.requeue(&frame);
        assert_eq!(queue.produce_frame(100).as_deref(), Some("a|b|c"));
    }

    #[test]
    fn test_oversized_record_travels_alone() {
        let queue = TxQueue::new();
        queue.push("x".repeat(20));
        queue.push("yy".to_string());

        assert_eq!(queue.produce_frame(8), Some("x".repeat(20)));
        assert_eq!(queue.produce_frame(8).as_deref(), Some("yy"));
    }

    #[test]
    fn test_split_frame() {
        let records: Vec<&str> = split_frame("a||b|").collect();
        assert_eq!(records, vec!["a", "b"]);
        assert_eq!(split_frame("").count(), 0);
    }
}
