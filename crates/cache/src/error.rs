//! Cache error types.

use std::sync::Arc;
use thiserror::Error;

/// Cache operation errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image decode/encode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("thumbnail task failed: {0}")]
    Task(String),

    // Concurrent callers ingesting the same digest share one result; the
    // losers see the winner's error through this variant.
    #[error(transparent)]
    Shared(#[from] Arc<CacheError>),
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
