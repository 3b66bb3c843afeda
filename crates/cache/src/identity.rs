//! Identity-key cache: (path, size, mtime) -> content digest.
//!
//! Lets a rescan skip rehashing files whose stat triple hasn't changed. The
//! whole cache lives in one JSON file; it is small (one record per known
//! file) and rewritten atomically on a debounce timer rather than per update.
//! Entries are evicted at load when idle past the disk TTL or when the file
//! they describe no longer exists.

use crate::error::CacheResult;
use crate::fsutil::write_atomic;
use lightbox_core::config::CacheConfig;
use lightbox_core::digest::{ContentDigest, IdentityKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CACHE_FILE: &str = "identity.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug)]
struct CachedDigest {
    digest: ContentDigest,
    /// The path as the caller gave it, so existence checks hit the real
    /// file; the key only holds a digest of the normalized form.
    path: PathBuf,
    last_used_secs: i64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<IdentityKey, CachedDigest>,
    dirty: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: IdentityKey,
    path: PathBuf,
    digest: ContentDigest,
    last_used_secs: i64,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    debounce: Duration,
    state: Mutex<State>,
    persist_pending: AtomicBool,
}

/// Persistent cache mapping identity keys to content digests.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct IdentityKeyCache {
    inner: Arc<Inner>,
}

impl IdentityKeyCache {
    /// Load the cache from disk.
    ///
    /// Entries idle past the disk TTL and entries whose file is gone are
    /// evicted here. A missing cache file starts an empty cache; a corrupt
    /// one is discarded with a warning and rebuilt from scratch. The cache is
    /// an accelerator, so losing it costs time, not data.
    pub async fn load(config: &CacheConfig) -> CacheResult<Self> {
        let path = config.root.join(CACHE_FILE);
        tokio::fs::create_dir_all(&config.root).await?;

        let mut entries = HashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedCache>(&bytes) {
                Ok(persisted) if persisted.version == FORMAT_VERSION => {
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    let ttl_secs = config.disk_ttl().as_secs() as i64;
                    let mut expired = 0usize;
                    let mut missing = 0usize;
                    for entry in persisted.entries {
                        if now.saturating_sub(entry.last_used_secs) > ttl_secs {
                            expired += 1;
                            continue;
                        }
                        if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
                            missing += 1;
                            continue;
                        }
                        entries.insert(
                            entry.key,
                            CachedDigest {
                                digest: entry.digest,
                                path: entry.path,
                                last_used_secs: entry.last_used_secs,
                            },
                        );
                    }
                    debug!(
                        kept = entries.len(),
                        expired, missing, "loaded identity cache"
                    );
                }
                Ok(persisted) => {
                    warn!(
                        version = persisted.version,
                        "unknown identity cache version, starting empty"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "corrupt identity cache, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                debounce: config.persist_debounce(),
                state: Mutex::new(State {
                    entries,
                    dirty: false,
                }),
                persist_pending: AtomicBool::new(false),
            }),
        })
    }

    /// Look up the digest for a file's stat triple.
    ///
    /// Only an exact match hits; any change to the file's size or mtime falls
    /// through to a rehash by the caller.
    pub async fn resolve(
        &self,
        path: &Path,
        file_size: u64,
        mtime_secs: i64,
    ) -> Option<ContentDigest> {
        let key = IdentityKey::for_path(path, file_size, mtime_secs);
        let mut state = self.inner.state.lock().await;
        let cached = state.entries.get_mut(&key)?;
        cached.last_used_secs = OffsetDateTime::now_utc().unix_timestamp();
        let digest = cached.digest;
        state.dirty = true;
        drop(state);

        self.schedule_persist();
        Some(digest)
    }

    /// Record the digest for a file's stat triple.
    pub async fn store(
        &self,
        path: &Path,
        file_size: u64,
        mtime_secs: i64,
        digest: ContentDigest,
    ) {
        let key = IdentityKey::for_path(path, file_size, mtime_secs);
        let mut state = self.inner.state.lock().await;
        state.entries.insert(
            key,
            CachedDigest {
                digest,
                path: path.to_path_buf(),
                last_used_secs: OffsetDateTime::now_utc().unix_timestamp(),
            },
        );
        state.dirty = true;
        drop(state);

        self.schedule_persist();
    }

    /// Number of cached keys.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write the cache to disk now if it has unsaved changes.
    pub async fn flush(&self) -> CacheResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.dirty {
            return Ok(());
        }

        let persisted = PersistedCache {
            version: FORMAT_VERSION,
            entries: state
                .entries
                .iter()
                .map(|(key, cached)| PersistedEntry {
                    key: *key,
                    path: cached.path.clone(),
                    digest: cached.digest,
                    last_used_secs: cached.last_used_secs,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&persisted)?;
        write_atomic(&self.inner.path, &bytes).await?;
        state.dirty = false;

        debug!(entries = persisted.entries.len(), "persisted identity cache");
        Ok(())
    }

    /// Arm the debounced persist timer; a burst of updates produces one write.
    fn schedule_persist(&self) {
        if self
            .inner
            .persist_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cache.inner.debounce).await;
            cache.inner.persist_pending.store(false, Ordering::Release);
            if let Err(e) = cache.flush().await {
                warn!(error = %e, "identity cache persist failed");
            }
        });
    }
}
