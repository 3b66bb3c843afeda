//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid shard index: {0} (must be 0..16)")]
    InvalidShardIndex(usize),

    #[error("digest {digest} belongs to shard {actual}, found in shard {expected}")]
    ShardMismatch {
        digest: String,
        expected: usize,
        actual: usize,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed shard record: {0}")]
    WireFormat(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
