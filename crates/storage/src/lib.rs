//! Object storage abstraction and backends for Lightbox.
//!
//! This crate provides:
//! - The `ObjectStore` trait the sync engine talks to
//! - Backends: local filesystem and S3-compatible
//! - An in-memory backend for tests (feature `mock`)

pub mod backends;
pub mod error;
pub mod traits;

#[cfg(feature = "mock")]
pub use backends::memory::MemoryBackend;
pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ObjectMeta, ObjectStore};

use lightbox_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
