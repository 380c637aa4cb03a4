//! CAS error types.

use std::io;
use thiserror::Error;

use crate::Digest;

/// Errors raised by the block store and its backends.
#[derive(Debug, Error)]
pub enum CasError {
    /// A referenced block is not present in the store.
    #[error("missing block: {0}")]
    MissingBlock(Digest),

    /// The key-value backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CasError {
    /// Create a Backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a Codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}

/// Result type for CAS operations.
pub type CasResult<T> = std::result::Result<T, CasError>;
