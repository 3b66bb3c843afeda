//! In-memory storage backend for tests.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
struct StoredObject {
    data: Bytes,
    generation: u64,
    stored_at: time::OffsetDateTime,
}

/// In-memory object store backed by a HashMap.
///
/// Every write bumps a generation counter that serves as the ETag, so
/// freshness-token behavior can be exercised without a real remote.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, StoredObject>>,
    generation: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.stored_at),
            etag: Some(format!("gen-{}", object.generation)),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(object.data.clone())
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                generation,
                stored_at: time::OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
