//! Catalog and sync error types.

use thiserror::Error;

/// Errors from catalog operations and sync cycles.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Core(#[from] lightbox_core::Error),

    #[error(transparent)]
    Storage(#[from] lightbox_storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out")]
    TransferTimeout { operation: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    // Concurrent sync() callers share one cycle; the joiners see the
    // initiator's error through this variant.
    #[error(transparent)]
    Shared(#[from] std::sync::Arc<CatalogError>),
}

impl CatalogError {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Storage(e) => e.is_transient(),
            CatalogError::TransferTimeout { .. } => true,
            CatalogError::Shared(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
