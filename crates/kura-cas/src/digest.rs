//! Content digests.
//!
//! The hash function is pluggable: anything that maps bytes to a fixed-length
//! string can address blocks. BLAKE3 is the default.

/// Hex-encoded content digest used as a block key.
pub type Digest = String;

/// Pure function from bytes to a fixed-length digest string.
pub trait ContentHasher: Send + Sync {
    /// Digest a chunk of content.
    fn digest(&self, bytes: &[u8]) -> Digest;

    /// Length in characters of every digest this hasher produces.
    fn digest_len(&self) -> usize;
}

/// BLAKE3, hex-encoded (64 characters).
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn digest(&self, bytes: &[u8]) -> Digest {
        hex::encode(blake3::hash(bytes).as_bytes())
    }

    fn digest_len(&self) -> usize {
        blake3::OUT_LEN * 2
    }
}
