//! # kura-cas
//!
//! Content-addressable block storage for kura.
//!
//! File content is split into chunks; each chunk is stored once under the
//! digest of its bytes, no matter how many files (or universes) reference it.
//! Storage goes through the [`Backend`]/[`KvStore`] contract, which any
//! asynchronous key-value engine can implement.

mod block_store;
mod digest;
mod error;
mod store;

pub use block_store::{BlockStore, SweepReport};
pub use digest::{Blake3Hasher, ContentHasher, Digest};
pub use error::{CasError, CasResult};
pub use store::{Backend, KvStore, MemoryBackend, MemoryStore};

/// Name of the backend store holding blocks.
pub const BLOCKS_STORE: &str = "blocks";
