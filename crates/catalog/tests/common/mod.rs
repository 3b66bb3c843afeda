//! Shared helpers for sync integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use lightbox_core::config::SyncConfig;
use lightbox_core::digest::ContentDigest;
use lightbox_core::entry::{CatalogEntry, LocalFields};
use lightbox_storage::{ObjectMeta, ObjectStore, StorageError, StorageResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Sync config with test-friendly retry timing.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        account: "test-account".to_string(),
        max_concurrent_transfers: 8,
        transfer_timeout_secs: 5,
        transfer_attempts: 3,
        retry_backoff_ms: 1,
    }
}

/// Build the nth entry whose digest lands in the given shard.
pub fn entry_for_shard_nth(shard: usize, nth: usize, filename: &str) -> CatalogEntry {
    let mut seed = 0u32;
    let mut found = 0usize;
    let digest = loop {
        let d = ContentDigest::compute(&seed.to_le_bytes());
        if d.shard_index() == shard {
            if found == nth {
                break d;
            }
            found += 1;
        }
        seed += 1;
    };
    CatalogEntry {
        digest,
        filename: filename.to_string(),
        file_size: 42,
        photo_date: OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap(),
        modified_date: OffsetDateTime::from_unix_timestamp(1_600_000_100).unwrap(),
        width: Some(800),
        height: Some(600),
        source_id: None,
        local: LocalFields::default(),
    }
}

pub fn entry_for_shard(shard: usize, filename: &str) -> CatalogEntry {
    entry_for_shard_nth(shard, 0, filename)
}

/// Wrapper that fails a number of operations with transient I/O errors.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    fail_gets: AtomicU32,
    fail_puts: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>, fail_gets: u32, fail_puts: u32) -> Self {
        Self {
            inner,
            fail_gets: AtomicU32::new(fail_gets),
            fail_puts: AtomicU32::new(fail_puts),
        }
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn transient() -> StorageError {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "injected transient failure",
        ))
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        if Self::should_fail(&self.fail_gets) {
            return Err(Self::transient());
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if Self::should_fail(&self.fail_puts) {
            return Err(Self::transient());
        }
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Wrapper that corrupts reads of keys containing a marker, a limited number
/// of times (`u32::MAX` for always).
pub struct TamperStore {
    inner: Arc<dyn ObjectStore>,
    key_marker: String,
    remaining: AtomicU32,
}

impl TamperStore {
    pub fn new(inner: Arc<dyn ObjectStore>, key_marker: &str, times: u32) -> Self {
        Self {
            inner,
            key_marker: key_marker.to_string(),
            remaining: AtomicU32::new(times),
        }
    }
}

#[async_trait]
impl ObjectStore for TamperStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let bytes = self.inner.get(key).await?;
        if key.contains(&self.key_marker)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            let mut tampered = bytes.to_vec();
            tampered.extend_from_slice(b"tampered\n");
            return Ok(Bytes::from(tampered));
        }
        Ok(bytes)
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "tamper"
    }
}

/// Wrapper that delays and counts operations, so tests can hold a cycle open
/// and assert how often the remote was actually read.
pub struct CountingStore {
    inner: Arc<dyn ObjectStore>,
    delay: Duration,
    pub gets: AtomicU32,
    pub heads: AtomicU32,
    pub puts: AtomicU32,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            gets: AtomicU32::new(0),
            heads: AtomicU32::new(0),
            puts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
