//! The 16-way sharded local catalog.
//!
//! Entries are partitioned by the leading hex nibble of their content digest.
//! Each shard tracks a dirty flag (synced fields changed since the last
//! acknowledged upload) and the checksum last seen on the remote, which is
//! what the sync engine's delta detection runs on. Shards persist as one JSON
//! file each under the catalog root; JSON rather than the wire format because
//! local-only fields never appear on the wire.

use crate::error::{CatalogError, CatalogResult};
use crate::resolver::resolve_import;
use lightbox_core::digest::ContentDigest;
use lightbox_core::entry::{BackupStatus, CatalogEntry};
use lightbox_core::{wire, Error as CoreError, SHARD_COUNT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct Shard {
    entries: BTreeMap<ContentDigest, CatalogEntry>,
    /// Synced fields changed since the last acknowledged upload or import.
    dirty: bool,
    /// Bumped on every synced-field change; lets the sync engine detect
    /// writes that landed while an upload was in flight.
    generation: u64,
    /// Checksum of this shard's bytes as last seen on the remote.
    last_synced: Option<ContentDigest>,
}

#[derive(Serialize, Deserialize)]
struct PersistedShard {
    version: u32,
    dirty: bool,
    last_synced: Option<ContentDigest>,
    entries: Vec<CatalogEntry>,
}

/// A snapshot of one shard's sync-relevant state.
#[derive(Clone, Debug)]
pub struct ShardState {
    pub dirty: bool,
    pub last_synced: Option<ContentDigest>,
    pub entry_count: usize,
}

struct CatalogInner {
    root: PathBuf,
    shards: [Mutex<Shard>; SHARD_COUNT],
}

/// Sharded catalog of photo entries.
///
/// Cheap to clone; clones share state. Locking is per shard, so operations on
/// different shards never contend.
#[derive(Clone)]
pub struct ShardCatalog {
    inner: Arc<CatalogInner>,
}

impl ShardCatalog {
    /// Open the catalog rooted at a directory, loading any persisted shards.
    ///
    /// Unlike the caches, shard files are real data: an unreadable one is an
    /// error, not a silent reset.
    pub async fn open(root: impl AsRef<Path>) -> CatalogResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut loaded: [Shard; SHARD_COUNT] = Default::default();
        for (index, shard) in loaded.iter_mut().enumerate() {
            let path = shard_file(&root, index);
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let persisted: PersistedShard = serde_json::from_slice(&bytes)?;
            for entry in persisted.entries {
                if entry.shard_index() != index {
                    return Err(CatalogError::Core(CoreError::ShardMismatch {
                        digest: entry.digest.to_hex(),
                        expected: index,
                        actual: entry.shard_index(),
                    }));
                }
                shard.entries.insert(entry.digest, entry);
            }
            shard.dirty = persisted.dirty;
            shard.last_synced = persisted.last_synced;
        }

        let total: usize = loaded.iter().map(|s| s.entries.len()).sum();
        debug!(entries = total, "opened catalog");

        Ok(Self {
            inner: Arc::new(CatalogInner {
                root,
                shards: loaded.map(Mutex::new),
            }),
        })
    }

    /// Insert or update an entry. Returns whether the synced state changed.
    ///
    /// Upserting an entry whose synced fields match the stored one is a no-op
    /// and does not mark the shard dirty. Local-only fields of an existing
    /// entry are never touched here; scans re-report photos they didn't star.
    pub async fn upsert(&self, entry: CatalogEntry) -> bool {
        let mut shard = self.inner.shards[entry.shard_index()].lock().await;
        match shard.entries.get_mut(&entry.digest) {
            Some(existing) => {
                if existing.synced_eq(&entry) {
                    return false;
                }
                let local = existing.local;
                *existing = entry;
                existing.local = local;
            }
            None => {
                shard.entries.insert(entry.digest, entry);
            }
        }
        shard.dirty = true;
        shard.generation += 1;
        true
    }

    /// Fetch an entry by digest.
    pub async fn get(&self, digest: &ContentDigest) -> Option<CatalogEntry> {
        let shard = self.inner.shards[digest.shard_index()].lock().await;
        shard.entries.get(digest).cloned()
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn remove(&self, digest: &ContentDigest) -> bool {
        let mut shard = self.inner.shards[digest.shard_index()].lock().await;
        if shard.entries.remove(digest).is_some() {
            shard.dirty = true;
            shard.generation += 1;
            true
        } else {
            false
        }
    }

    /// Star or unstar a photo. Local-only: never marks the shard dirty.
    pub async fn set_starred(&self, digest: &ContentDigest, starred: bool) -> bool {
        let mut shard = self.inner.shards[digest.shard_index()].lock().await;
        match shard.entries.get_mut(digest) {
            Some(entry) => {
                entry.local.starred = starred;
                true
            }
            None => false,
        }
    }

    /// Update a photo's backup state. Local-only: never marks the shard dirty.
    pub async fn set_backup_status(&self, digest: &ContentDigest, status: BackupStatus) -> bool {
        let mut shard = self.inner.shards[digest.shard_index()].lock().await;
        match shard.entries.get_mut(digest) {
            Some(entry) => {
                entry.local.backup_status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot one shard's entries, sorted by digest.
    pub async fn shard_entries(&self, shard_index: usize) -> CatalogResult<Vec<CatalogEntry>> {
        check_index(shard_index)?;
        let shard = self.inner.shards[shard_index].lock().await;
        Ok(shard.entries.values().cloned().collect())
    }

    /// Serialize one shard to its wire bytes.
    ///
    /// Returns the bytes and the shard generation they were taken at; pass
    /// the generation back to [`upload_acknowledged`](Self::upload_acknowledged)
    /// so a write that raced the upload keeps the shard dirty.
    pub async fn export_shard(&self, shard_index: usize) -> CatalogResult<(Vec<u8>, u64)> {
        check_index(shard_index)?;
        let shard = self.inner.shards[shard_index].lock().await;
        let entries: Vec<CatalogEntry> = shard.entries.values().cloned().collect();
        Ok((wire::encode_shard(&entries), shard.generation))
    }

    /// Replace one shard's entries with a downloaded remote set.
    ///
    /// Remote wins: synced fields and the set of digests come entirely from
    /// the remote, local-only fields are carried forward by digest. Clears
    /// the dirty flag and records the remote checksum. Returns the number of
    /// entries after the import.
    #[instrument(skip(self, remote_entries), fields(shard = format_args!("{shard_index:x}")))]
    pub async fn import_shard(
        &self,
        shard_index: usize,
        remote_entries: Vec<CatalogEntry>,
        remote_checksum: ContentDigest,
    ) -> CatalogResult<usize> {
        check_index(shard_index)?;
        for entry in &remote_entries {
            if entry.shard_index() != shard_index {
                return Err(CatalogError::Core(CoreError::ShardMismatch {
                    digest: entry.digest.to_hex(),
                    expected: shard_index,
                    actual: entry.shard_index(),
                }));
            }
        }

        let mut shard = self.inner.shards[shard_index].lock().await;
        shard.entries = resolve_import(remote_entries, &shard.entries);
        shard.dirty = false;
        shard.generation += 1;
        shard.last_synced = Some(remote_checksum);
        Ok(shard.entries.len())
    }

    /// Record that an exported shard was uploaded and its checksum published.
    ///
    /// The dirty flag clears only if the shard hasn't changed since the
    /// export; either way the remote now holds `checksum`. Returns whether
    /// the shard is now clean.
    pub async fn upload_acknowledged(
        &self,
        shard_index: usize,
        generation: u64,
        checksum: ContentDigest,
    ) -> CatalogResult<bool> {
        check_index(shard_index)?;
        let mut shard = self.inner.shards[shard_index].lock().await;
        shard.last_synced = Some(checksum);
        if shard.generation == generation {
            shard.dirty = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Snapshot one shard's sync state.
    pub async fn shard_state(&self, shard_index: usize) -> CatalogResult<ShardState> {
        check_index(shard_index)?;
        let shard = self.inner.shards[shard_index].lock().await;
        Ok(ShardState {
            dirty: shard.dirty,
            last_synced: shard.last_synced,
            entry_count: shard.entries.len(),
        })
    }

    /// Snapshot all shards' sync state.
    pub async fn shard_states(&self) -> [ShardState; SHARD_COUNT] {
        let mut states = Vec::with_capacity(SHARD_COUNT);
        for shard in &self.inner.shards {
            let shard = shard.lock().await;
            states.push(ShardState {
                dirty: shard.dirty,
                last_synced: shard.last_synced,
                entry_count: shard.entries.len(),
            });
        }
        match states.try_into() {
            Ok(array) => array,
            Err(_) => unreachable!("exactly SHARD_COUNT states collected"),
        }
    }

    /// Total number of entries across all shards.
    pub async fn entry_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.inner.shards {
            total += shard.lock().await.entries.len();
        }
        total
    }

    /// Write all shards to disk.
    #[instrument(skip(self))]
    pub async fn persist(&self) -> CatalogResult<()> {
        for (index, shard) in self.inner.shards.iter().enumerate() {
            let persisted = {
                let shard = shard.lock().await;
                PersistedShard {
                    version: FORMAT_VERSION,
                    dirty: shard.dirty,
                    last_synced: shard.last_synced,
                    entries: shard.entries.values().cloned().collect(),
                }
            };
            let bytes = serde_json::to_vec(&persisted)?;
            write_atomic(&shard_file(&self.inner.root, index), &bytes).await?;
        }
        Ok(())
    }
}

fn shard_file(root: &Path, shard_index: usize) -> PathBuf {
    root.join(format!("shard-{shard_index:x}.json"))
}

fn check_index(shard_index: usize) -> CatalogResult<()> {
    if shard_index >= SHARD_COUNT {
        return Err(CatalogError::Core(CoreError::InvalidShardIndex(
            shard_index,
        )));
    }
    Ok(())
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_file_name(format!(
        "{}.tmp.{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        Uuid::new_v4()
    ));
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await
}
