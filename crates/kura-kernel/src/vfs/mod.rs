//! The namespace: inode types, the path table and its errors.

mod error;
mod namespace;
mod types;

pub use error::{FsError, FsResult};
pub use namespace::Namespace;
pub use types::{
    FileContent, FileHandle, Inode, InodeType, Metainfo, OCTET_STREAM, TEXT_PLAIN, Tombstone,
};
