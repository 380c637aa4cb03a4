//! File system error types.

use std::io;
use thiserror::Error;

use kura_cas::CasError;

/// File system error type.
///
/// Each variant maps onto a POSIX-style code, available through
/// [`FsError::code`].
#[derive(Debug, Error)]
pub enum FsError {
    /// Path, or a required parent directory, not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Destination already occupied.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A referenced content block is missing.
    #[error("I/O error: {0}")]
    Io(String),

    /// Argument rejected before touching any state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The storage backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// POSIX-style error code.
    pub fn code(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "ENOENT",
            FsError::AlreadyExists(_) => "EEXIST",
            FsError::IsADirectory(_) => "EISDIR",
            FsError::NotADirectory(_) => "ENOTDIR",
            FsError::Io(_) | FsError::Backend(_) | FsError::Other(_) => "EIO",
            FsError::InvalidArgument(_) => "EINVAL",
        }
    }
}

impl From<CasError> for FsError {
    fn from(e: CasError) -> Self {
        match e {
            CasError::MissingBlock(digest) => FsError::Io(format!("missing block: {digest}")),
            other => FsError::Backend(other.to_string()),
        }
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            FsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            FsError::Io(msg) | FsError::Backend(msg) | FsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// Result type for file system operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(FsError::not_found("/a").code(), "ENOENT");
        assert_eq!(FsError::already_exists("/a").code(), "EEXIST");
        assert_eq!(FsError::is_a_directory("/a").code(), "EISDIR");
        assert_eq!(FsError::not_a_directory("/a").code(), "ENOTDIR");
        assert_eq!(FsError::invalid_argument("x").code(), "EINVAL");
    }

    #[test]
    fn test_missing_block_maps_to_eio() {
        let err: FsError = CasError::MissingBlock("abc".into()).into();
        assert_eq!(err.code(), "EIO");
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_io_error_kind() {
        let err: io::Error = FsError::not_found("/x").into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
