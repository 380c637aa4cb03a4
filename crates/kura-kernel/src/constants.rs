//! Engine defaults and store names.

/// Bytes per content chunk.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Seconds between garbage collection passes.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 30;

/// Milliseconds between outbound replication frames.
pub const DEFAULT_TX_INTERVAL_MS: u64 = 10_000;

/// Byte budget of one outbound frame.
pub const DEFAULT_FRAME_SIZE: usize = 138_000;

/// Capacity of the async event subscription channel.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Seconds a deletion is remembered. Zero keeps tombstones forever.
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 0;

/// Backend store holding inode JSON keyed by path.
pub const INODES_STORE: &str = "inodes";

/// Backend store holding tombstone JSON keyed by path.
pub const TOMBSTONES_STORE: &str = "tombstones";

pub use kura_cas::BLOCKS_STORE;
