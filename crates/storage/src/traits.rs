//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Remote-assigned freshness token (ETag or equivalent).
    ///
    /// Comparing this against a previously observed value lets a caller skip
    /// re-fetching an unchanged object.
    pub etag: Option<String>,
}

/// Object store abstraction consumed by the sync engine.
///
/// Shard and manifest objects are small (kilobytes), so the whole-object
/// get/put interface is deliberate; there is no streaming here.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically: a concurrent reader sees either the old or
    /// the new content, never a partial write.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the name of this storage backend (used for logging).
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
