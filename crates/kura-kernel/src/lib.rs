//! # kura-kernel
//!
//! A virtual, content-addressed file system.
//!
//! File content lives in a deduplicating block store; the namespace maps
//! absolute paths to inodes that list their blocks in order. Besides the
//! default tree rooted at `/`, any number of *universes* rooted at `@name` can
//! be cloned from one another; they share blocks but nothing else.
//!
//! Every mutation is announced on an observer bus. Persistence to the
//! backend and replication to peers are both observers: peers exchange
//! bounded frames of records and merge them last-writer-wins, with tombstones
//! remembering deletions.
//!
//! ```no_run
//! # async fn demo() -> kura_kernel::FsResult<()> {
//! let kura = kura_kernel::Kura::in_memory().await?;
//! kura.mkdir("/docs")?;
//! kura.write_file("/docs/hello.txt", "hello", None).await?;
//! kura.clone_universe("/", "draft")?;
//! assert!(kura.is_file("@draft/docs/hello.txt"));
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod db;
pub mod flows;
pub mod kernel;
pub mod path;
pub mod quota;
pub mod sync;
pub mod tree;
pub mod universe;
pub mod vfs;

pub use config::{ConfigError, KuraConfig};
pub use db::SqliteBackend;
pub use flows::{EventKind, FlowBus, FlowMessage, FsEvent, HasSubject, OpSource, Subscription};
pub use kernel::Kura;
pub use quota::QuotaReport;
pub use sync::{MergeReport, Record};
pub use vfs::{
    FileContent, FileHandle, FsError, FsResult, Inode, InodeType, Metainfo, Namespace, Tombstone,
};

pub use kura_cas::{Backend, KvStore, MemoryBackend, SweepReport};
