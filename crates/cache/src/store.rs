//! Content-addressed digest store: digest -> thumbnail + metadata.
//!
//! Two tiers: a bounded in-memory layer for hot entries and a disk layer laid
//! out as `thumbs/{first two hex chars}/{digest}.dat` with a JSON sidecar
//! carrying the extracted metadata and a last-access stamp. Work is keyed by
//! content digest, so a photo is decoded and thumbnailed once no matter how
//! many paths or callers reference it.

use crate::error::{CacheError, CacheResult};
use crate::fsutil::write_atomic;
use crate::thumbnail;
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lightbox_core::config::CacheConfig;
use lightbox_core::digest::ContentDigest;
use lightbox_core::metadata::PhotoMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const THUMBS_DIR: &str = "thumbs";

/// A cached thumbnail and the metadata extracted alongside it.
#[derive(Clone, Debug)]
pub struct CachedPhoto {
    /// JPEG-encoded thumbnail bytes.
    pub thumbnail: Bytes,
    /// Metadata extracted from the original photo.
    pub metadata: PhotoMetadata,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    metadata: PhotoMetadata,
    last_access_secs: i64,
}

struct MemoryEntry {
    photo: Arc<CachedPhoto>,
    last_used: u64,
}

#[derive(Default)]
struct MemoryCache {
    entries: HashMap<ContentDigest, MemoryEntry>,
    total_bytes: u64,
    tick: u64,
}

impl MemoryCache {
    fn get(&mut self, digest: &ContentDigest) -> Option<Arc<CachedPhoto>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(digest)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.photo))
    }

    fn insert(
        &mut self,
        digest: ContentDigest,
        photo: Arc<CachedPhoto>,
        max_items: usize,
        max_bytes: u64,
    ) {
        self.tick += 1;
        let size = photo.thumbnail.len() as u64;
        if let Some(old) = self.entries.insert(
            digest,
            MemoryEntry {
                photo,
                last_used: self.tick,
            },
        ) {
            self.total_bytes -= old.photo.thumbnail.len() as u64;
        }
        self.total_bytes += size;

        // Both caps hold at once; evicted entries stay on disk.
        while self.entries.len() > max_items || self.total_bytes > max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(digest, _)| *digest);
            match oldest {
                Some(victim) => {
                    if let Some(removed) = self.entries.remove(&victim) {
                        self.total_bytes -= removed.photo.thumbnail.len() as u64;
                    }
                }
                None => break,
            }
        }
    }
}

type IngestFuture = Shared<BoxFuture<'static, Result<Arc<CachedPhoto>, Arc<CacheError>>>>;

struct StoreInner {
    root: PathBuf,
    max_items: usize,
    max_bytes: u64,
    memory: Mutex<MemoryCache>,
    in_flight: Mutex<HashMap<ContentDigest, IngestFuture>>,
}

impl StoreInner {
    fn data_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root
            .join(digest.bucket())
            .join(format!("{digest}.dat"))
    }

    fn sidecar_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root
            .join(digest.bucket())
            .join(format!("{digest}.json"))
    }

    /// Best-effort removal of a digest's disk pair.
    async fn remove_pair(&self, digest: &ContentDigest) {
        let _ = fs::remove_file(self.data_path(digest)).await;
        let _ = fs::remove_file(self.sidecar_path(digest)).await;
    }

    /// Load a digest from disk, refreshing its last-access stamp.
    ///
    /// Any corruption (missing half of the pair, unparseable sidecar) is
    /// absorbed to a miss: the damaged entry is removed and the caller
    /// regenerates it from the original bytes.
    async fn load_from_disk(&self, digest: &ContentDigest) -> CacheResult<Option<Arc<CachedPhoto>>> {
        let data = match fs::read(self.data_path(digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sidecar_bytes = match fs::read(self.sidecar_path(digest)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%digest, "thumbnail without sidecar, discarding");
                self.remove_pair(digest).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut sidecar: Sidecar = match serde_json::from_slice(&sidecar_bytes) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!(%digest, error = %e, "corrupt sidecar, discarding entry");
                self.remove_pair(digest).await;
                return Ok(None);
            }
        };

        sidecar.last_access_secs = OffsetDateTime::now_utc().unix_timestamp();
        match serde_json::to_vec(&sidecar) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.sidecar_path(digest), &bytes).await {
                    warn!(%digest, error = %e, "failed to refresh sidecar access stamp");
                }
            }
            Err(e) => warn!(%digest, error = %e, "failed to refresh sidecar access stamp"),
        }

        Ok(Some(Arc::new(CachedPhoto {
            thumbnail: Bytes::from(data),
            metadata: sidecar.metadata,
        })))
    }

    async fn write_to_disk(
        &self,
        digest: &ContentDigest,
        rendered: &thumbnail::RenderedPhoto,
    ) -> CacheResult<()> {
        write_atomic(&self.data_path(digest), &rendered.thumbnail).await?;
        let sidecar = Sidecar {
            metadata: rendered.metadata.clone(),
            last_access_secs: OffsetDateTime::now_utc().unix_timestamp(),
        };
        write_atomic(&self.sidecar_path(digest), &serde_json::to_vec(&sidecar)?).await?;
        Ok(())
    }
}

/// Two-tier content-addressed store for thumbnails and photo metadata.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DigestStore {
    inner: Arc<StoreInner>,
}

impl DigestStore {
    /// Open the store rooted under the cache directory.
    pub async fn open(config: &CacheConfig) -> CacheResult<Self> {
        let root = config.root.join(THUMBS_DIR);
        fs::create_dir_all(&root).await?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                max_items: config.max_memory_items,
                max_bytes: config.max_memory_bytes,
                memory: Mutex::new(MemoryCache::default()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Ensure a digest's thumbnail and metadata exist, rendering if needed.
    ///
    /// Concurrent calls for the same digest coalesce onto one render; the
    /// original bytes are only decoded when neither tier has the entry.
    #[instrument(skip(self, original), fields(%digest, original_len = original.len()))]
    pub async fn ingest(
        &self,
        digest: ContentDigest,
        original: Bytes,
    ) -> CacheResult<Arc<CachedPhoto>> {
        if let Some(photo) = self.inner.memory.lock().await.get(&digest) {
            return Ok(photo);
        }

        let fut = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&digest) {
                Some(existing) => existing.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fut: IngestFuture = async move {
                        let result = ingest_inner(&inner, digest, original).await;
                        inner.in_flight.lock().await.remove(&digest);
                        result.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(digest, fut.clone());
                    fut
                }
            }
        };

        Ok(fut.await?)
    }

    /// Fetch a digest's thumbnail and metadata, memory first, then disk.
    ///
    /// Returns `None` on a full miss (including a corrupt disk entry, which
    /// is discarded); the caller re-ingests from the original bytes.
    #[instrument(skip(self), fields(%digest))]
    pub async fn get(&self, digest: &ContentDigest) -> CacheResult<Option<Arc<CachedPhoto>>> {
        if let Some(photo) = self.inner.memory.lock().await.get(digest) {
            return Ok(Some(photo));
        }

        match self.inner.load_from_disk(digest).await? {
            Some(photo) => {
                self.inner.memory.lock().await.insert(
                    *digest,
                    Arc::clone(&photo),
                    self.inner.max_items,
                    self.inner.max_bytes,
                );
                Ok(Some(photo))
            }
            None => Ok(None),
        }
    }

    /// Evict disk entries not accessed within the TTL. Returns the number of
    /// entries removed.
    #[instrument(skip(self))]
    pub async fn evict_older_than(&self, ttl: Duration) -> CacheResult<usize> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let ttl_secs = ttl.as_secs() as i64;
        let mut removed = 0usize;

        let mut buckets = match fs::read_dir(&self.inner.root).await {
            Ok(buckets) => buckets,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let digest = match path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| ContentDigest::from_hex(s).ok())
                {
                    Some(digest) => digest,
                    None => continue,
                };

                let stale = match fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
                        Ok(sidecar) => now.saturating_sub(sidecar.last_access_secs) > ttl_secs,
                        // Unreadable sidecars count as stale.
                        Err(_) => true,
                    },
                    Err(_) => true,
                };
                if stale {
                    self.inner.remove_pair(&digest).await;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "evicted idle thumbnail entries");
        }
        Ok(removed)
    }
}

async fn ingest_inner(
    inner: &Arc<StoreInner>,
    digest: ContentDigest,
    original: Bytes,
) -> CacheResult<Arc<CachedPhoto>> {
    if let Some(photo) = inner.load_from_disk(&digest).await? {
        inner.memory.lock().await.insert(
            digest,
            Arc::clone(&photo),
            inner.max_items,
            inner.max_bytes,
        );
        return Ok(photo);
    }

    // Decode and thumbnail off the async runtime.
    let rendered = tokio::task::spawn_blocking(move || thumbnail::render(&original))
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

    inner.write_to_disk(&digest, &rendered).await?;

    let photo = Arc::new(CachedPhoto {
        thumbnail: Bytes::from(rendered.thumbnail),
        metadata: rendered.metadata,
    });
    inner.memory.lock().await.insert(
        digest,
        Arc::clone(&photo),
        inner.max_items,
        inner.max_bytes,
    );
    Ok(photo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::path::Path;

    fn photo_bytes(seed: u8) -> Bytes {
        let img = ImageBuffer::from_fn(64, 48, |x, y| {
            Rgb([seed, (x % 256) as u8, (y % 256) as u8])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    fn test_config(root: &Path) -> CacheConfig {
        CacheConfig {
            root: root.to_path_buf(),
            ..CacheConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingest_then_get_hits_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::open(&test_config(dir.path())).await.unwrap();

        let original = photo_bytes(1);
        let digest = ContentDigest::compute(&original);
        let ingested = store.ingest(digest, original).await.unwrap();

        let fetched = store.get(&digest).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&ingested, &fetched));
        assert_eq!(fetched.metadata.width, 64);
        assert_eq!(fetched.metadata.height, 48);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disk_tier_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let original = photo_bytes(2);
        let digest = ContentDigest::compute(&original);
        {
            let store = DigestStore::open(&config).await.unwrap();
            store.ingest(digest, original).await.unwrap();
        }

        let reopened = DigestStore::open(&config).await.unwrap();
        let photo = reopened.get(&digest).await.unwrap().unwrap();
        assert!(!photo.thumbnail.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_ingest_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::open(&test_config(dir.path())).await.unwrap();

        let original = photo_bytes(3);
        let digest = ContentDigest::compute(&original);

        let (a, b) = tokio::join!(
            store.ingest(digest, original.clone()),
            store.ingest(digest, original)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_item_cap_evicts_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_memory_items: 1,
            ..test_config(dir.path())
        };
        let store = DigestStore::open(&config).await.unwrap();

        let first = photo_bytes(4);
        let second = photo_bytes(5);
        let first_digest = ContentDigest::compute(&first);
        let second_digest = ContentDigest::compute(&second);

        store.ingest(first_digest, first).await.unwrap();
        store.ingest(second_digest, second).await.unwrap();

        assert_eq!(store.inner.memory.lock().await.entries.len(), 1);
        // The evicted entry is still served from disk.
        assert!(store.get(&first_digest).await.unwrap().is_some());
        assert!(store.get(&second_digest).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_byte_cap_bounds_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_memory_bytes: 1,
            ..test_config(dir.path())
        };
        let store = DigestStore::open(&config).await.unwrap();

        let original = photo_bytes(6);
        let digest = ContentDigest::compute(&original);
        store.ingest(digest, original).await.unwrap();

        assert!(store.inner.memory.lock().await.entries.is_empty());
        assert!(store.get(&digest).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupt_sidecar_absorbed_to_miss() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = DigestStore::open(&config).await.unwrap();

        let original = photo_bytes(7);
        let digest = ContentDigest::compute(&original);
        store.ingest(digest, original).await.unwrap();

        let sidecar = store.inner.sidecar_path(&digest);
        std::fs::write(&sidecar, b"garbage").unwrap();

        // Fresh store so memory can't answer.
        let reopened = DigestStore::open(&config).await.unwrap();
        assert!(reopened.get(&digest).await.unwrap().is_none());
        assert!(!store.inner.data_path(&digest).exists());
        assert!(!sidecar.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_evict_older_than_removes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = DigestStore::open(&config).await.unwrap();

        let original = photo_bytes(8);
        let digest = ContentDigest::compute(&original);
        store.ingest(digest, original).await.unwrap();

        // Backdate the access stamp past any reasonable TTL.
        let sidecar_path = store.inner.sidecar_path(&digest);
        let mut sidecar: Sidecar =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
        sidecar.last_access_secs -= 90 * 24 * 60 * 60;
        std::fs::write(&sidecar_path, serde_json::to_vec(&sidecar).unwrap()).unwrap();

        let removed = store
            .evict_older_than(Duration::from_secs(30 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!sidecar_path.exists());
    }
}
