//! Key-value backend contract.
//!
//! A [`Backend`] hands out named [`KvStore`]s (`blocks`, `inodes`, ...). Every
//! operation is asynchronous so that durable backends can suspend the caller
//! without blocking other in-process work.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::CasResult;

/// One named key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value.
    async fn get(&self, key: &str) -> CasResult<Option<Vec<u8>>>;

    /// Insert or replace a value.
    async fn put(&self, key: &str, value: Vec<u8>) -> CasResult<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> CasResult<()>;

    /// Enumerate every key.
    async fn keys(&self) -> CasResult<Vec<String>>;

    /// Enumerate every key-value pair.
    async fn entries(&self) -> CasResult<Vec<(String, Vec<u8>)>>;

    /// Check whether a key is present.
    async fn has(&self, key: &str) -> CasResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Factory for named stores.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open (creating if needed) the store called `name`.
    async fn open_store(&self, name: &str) -> CasResult<Arc<dyn KvStore>>;
}

/// In-memory store. Ordered so enumeration is deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> CasResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CasResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CasResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> CasResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn entries(&self) -> CasResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn has(&self, key: &str) -> CasResult<bool> {
        Ok(self.entries.read().contains_key(key))
    }
}

/// In-memory backend.
///
/// Opening the same name twice returns the same store, so an engine can be
/// dropped and reopened against one backend. All data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle on a named store, for inspection in tests and tools.
    pub fn store(&self, name: &str) -> Arc<MemoryStore> {
        self.stores
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open_store(&self, name: &str) -> CasResult<Arc<dyn KvStore>> {
        Ok(self.store(name))
    }
}
