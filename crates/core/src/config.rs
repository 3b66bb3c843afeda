//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::SHARD_COUNT;

/// Cache configuration (identity-key cache + digest store).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory for the on-disk caches.
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    /// Maximum number of photo digests held in memory.
    #[serde(default = "default_max_memory_items")]
    pub max_memory_items: usize,
    /// Maximum total bytes of thumbnails held in memory.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Days of inactivity before a disk cache entry is evicted.
    #[serde(default = "default_disk_ttl_days")]
    pub disk_ttl_days: u32,
    /// Debounce window for identity cache persistence, in milliseconds.
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_max_memory_items() -> usize {
    512
}

fn default_max_memory_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_disk_ttl_days() -> u32 {
    30
}

fn default_persist_debounce_ms() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_memory_items: default_max_memory_items(),
            max_memory_bytes: default_max_memory_bytes(),
            disk_ttl_days: default_disk_ttl_days(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl CacheConfig {
    /// Idle age after which disk cache entries are evicted.
    pub fn disk_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.disk_ttl_days) * 24 * 60 * 60)
    }

    /// Debounce window for identity cache persistence.
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Remote storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (testing and local mirrors).
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible
        /// services; AWS S3 requires virtual-hosted style (false).
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/remote"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Sync engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Account identifier used to namespace remote keys.
    pub account: String,
    /// Maximum concurrent shard transfers within one sync cycle.
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// Per-transfer timeout in seconds.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Transfer attempts per shard per cycle (first try + retries).
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u32,
    /// Initial retry backoff in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_concurrent_transfers() -> usize {
    8
}

fn default_transfer_timeout_secs() -> u64 {
    30
}

fn default_transfer_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl SyncConfig {
    /// Per-transfer timeout.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Backoff before the given retry (1-based), doubling per attempt.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let multiplier = 1u64 << retry.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(multiplier))
    }

    /// Validate sync configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.account.is_empty() {
            return Err("sync.account must not be empty".to_string());
        }
        if self.account.contains('/') {
            return Err("sync.account must not contain '/'".to_string());
        }
        if self.max_concurrent_transfers == 0 || self.max_concurrent_transfers > SHARD_COUNT {
            return Err(format!(
                "sync.max_concurrent_transfers must be 1..={SHARD_COUNT}"
            ));
        }
        if self.transfer_attempts == 0 {
            return Err("sync.transfer_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory for the local catalog (shard files + sync state).
    #[serde(default = "default_catalog_root")]
    pub catalog_root: PathBuf,
    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Remote storage backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sync engine configuration.
    pub sync: SyncConfig,
}

fn default_catalog_root() -> PathBuf {
    PathBuf::from("./data/catalog")
}

impl AppConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.sync.validate()
    }

    /// Create a test configuration rooted under the given directory.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            catalog_root: root.join("catalog"),
            cache: CacheConfig {
                root: root.join("cache"),
                ..CacheConfig::default()
            },
            storage: StorageConfig::Filesystem {
                path: root.join("remote"),
            },
            sync: SyncConfig {
                account: "test-account".to_string(),
                max_concurrent_transfers: default_max_concurrent_transfers(),
                transfer_timeout_secs: default_transfer_timeout_secs(),
                transfer_attempts: default_transfer_attempts(),
                retry_backoff_ms: 10,
            },
        }
    }
}
