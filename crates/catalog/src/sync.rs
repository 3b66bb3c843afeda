//! Checksum-delta sync between the local catalog and a remote object store.
//!
//! One sync cycle: fetch the remote manifest (skipped when its ETag matches
//! the cached copy), compare each shard's remote checksum against the local
//! sync state, then transfer only the shards that differ. Remote changes win
//! and are imported wholesale; dirty shards with no remote change are
//! uploaded, and one manifest publish at the end makes the uploads visible.
//!
//! Shards transfer concurrently under a semaphore, each with its own timeout
//! and retry budget. A shard that fails is reported in the summary and never
//! takes the other fifteen down with it.

use crate::catalog::{ShardCatalog, ShardState};
use crate::error::{CatalogError, CatalogResult};
use bytes::Bytes;
use futures::future::{BoxFuture, WeakShared};
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use lightbox_core::config::SyncConfig;
use lightbox_core::digest::ContentDigest;
use lightbox_core::manifest::{manifest_key, shard_key, Manifest};
use lightbox_core::{wire, Error as CoreError, SHARD_COUNT};
use lightbox_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// What happened to one shard during a sync cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardOutcome {
    /// No delta between local and remote.
    Clean,
    /// Remote change imported into the local catalog.
    Downloaded { entries: usize },
    /// Local change uploaded and published.
    Uploaded,
    /// This shard's transfer failed; others were unaffected.
    Failed { reason: String },
}

/// Result of one sync cycle.
#[derive(Clone, Debug)]
pub struct SyncSummary {
    /// Per-shard outcomes, indexed by leading hex nibble.
    pub outcomes: [ShardOutcome; SHARD_COUNT],
    /// Manifest version after the cycle.
    pub manifest_version: u64,
}

impl SyncSummary {
    /// Number of shards whose transfer failed.
    pub fn failed_shards(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ShardOutcome::Failed { .. }))
            .count()
    }

    /// Whether the cycle moved any data at all.
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| matches!(o, ShardOutcome::Clean))
    }
}

type SyncFuture = BoxFuture<'static, Result<Arc<SyncSummary>, Arc<CatalogError>>>;

struct EngineInner {
    catalog: ShardCatalog,
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
    /// Manifest from the last successful fetch, ETag included, for the
    /// not-modified short-circuit.
    cached_manifest: Mutex<Option<Manifest>>,
    /// The in-flight cycle, if any. Weak: when every caller drops, the cycle
    /// is cancelled rather than kept running unobserved.
    in_flight: Mutex<Option<WeakShared<SyncFuture>>>,
}

/// Sync engine tying a [`ShardCatalog`] to a remote object store.
///
/// Cheap to clone; clones share state. Concurrent [`sync`](Self::sync) calls
/// join the in-flight cycle instead of starting another, so there is never
/// more than one cycle running per engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create a sync engine. Fails on invalid configuration.
    pub fn new(
        catalog: ShardCatalog,
        store: Arc<dyn ObjectStore>,
        config: SyncConfig,
    ) -> CatalogResult<Self> {
        config.validate().map_err(CatalogError::Config)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                catalog,
                store,
                config,
                cached_manifest: Mutex::new(None),
                in_flight: Mutex::new(None),
            }),
        })
    }

    /// Run one sync cycle, or join the one already running.
    ///
    /// All concurrent callers resolve to the same summary.
    pub async fn sync(&self) -> CatalogResult<Arc<SyncSummary>> {
        let fut = {
            let mut slot = self.inner.in_flight.lock().await;
            let joined = slot.as_ref().and_then(WeakShared::upgrade);
            match joined {
                Some(fut) => fut,
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fut = async move {
                        let result = sync_cycle(&inner).await;
                        *inner.in_flight.lock().await = None;
                        result.map(Arc::new).map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *slot = fut.downgrade();
                    fut
                }
            }
        };
        Ok(fut.await?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShardPlan {
    Clean,
    Download,
    Upload,
}

/// Decide a shard's transfer direction.
///
/// A remote checksum differing from the last-synced one always downloads,
/// dirty or not: the remote wins conflicts, and the import carries local-only
/// fields forward. Otherwise a dirty shard uploads. A remote that has lost a
/// previously synced shard gets it re-uploaded.
fn plan_shard(state: &ShardState, remote: Option<ContentDigest>) -> ShardPlan {
    match remote {
        Some(checksum) if state.last_synced != Some(checksum) => ShardPlan::Download,
        None if state.last_synced.is_some() => ShardPlan::Upload,
        _ if state.dirty => ShardPlan::Upload,
        _ => ShardPlan::Clean,
    }
}

enum TaskOutcome {
    Downloaded { entries: usize },
    UploadedPending { checksum: ContentDigest, generation: u64 },
}

#[instrument(skip(inner), fields(account = %inner.config.account))]
async fn sync_cycle(inner: &Arc<EngineInner>) -> CatalogResult<SyncSummary> {
    let manifest = fetch_manifest(inner).await?;
    debug!(version = manifest.version, "fetched manifest");

    let semaphore = Semaphore::new(inner.config.max_concurrent_transfers);
    let mut outcomes: [ShardOutcome; SHARD_COUNT] =
        std::array::from_fn(|_| ShardOutcome::Clean);

    let mut tasks = FuturesUnordered::new();
    for shard_index in 0..SHARD_COUNT {
        let state = inner.catalog.shard_state(shard_index).await?;
        let remote = manifest.checksums[shard_index];
        let plan = plan_shard(&state, remote);
        if plan == ShardPlan::Clean {
            continue;
        }

        let semaphore = &semaphore;
        tasks.push(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(e) => return (shard_index, Err(CatalogError::Config(e.to_string()))),
            };
            let result = match plan {
                ShardPlan::Download => {
                    // remote is Some by construction of the Download plan.
                    match remote {
                        Some(expected) => download_shard(inner, shard_index, expected).await,
                        None => Err(CatalogError::Config(
                            "download planned without remote checksum".to_string(),
                        )),
                    }
                }
                ShardPlan::Upload => upload_shard(inner, shard_index).await,
                ShardPlan::Clean => unreachable!("clean shards are not queued"),
            };
            (shard_index, result)
        });
    }

    let mut uploads: Vec<(usize, ContentDigest, u64)> = Vec::new();
    while let Some((shard_index, result)) = tasks.next().await {
        match result {
            Ok(TaskOutcome::Downloaded { entries }) => {
                info!(shard = format_args!("{shard_index:x}"), entries, "shard downloaded");
                outcomes[shard_index] = ShardOutcome::Downloaded { entries };
            }
            Ok(TaskOutcome::UploadedPending {
                checksum,
                generation,
            }) => {
                uploads.push((shard_index, checksum, generation));
            }
            Err(e) => {
                warn!(shard = format_args!("{shard_index:x}"), error = %e, "shard transfer failed");
                outcomes[shard_index] = ShardOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        }
    }

    // Uploaded shard objects stay invisible to other devices until the
    // manifest publish; local dirty flags clear only once that lands.
    let mut manifest_version = manifest.version;
    if !uploads.is_empty() {
        let mut published = manifest.clone();
        published.version += 1;
        for (shard_index, checksum, _) in &uploads {
            published.checksums[*shard_index] = Some(*checksum);
        }
        published.etag = None;

        let body = Bytes::from(published.to_json()?);
        let key = manifest_key(&inner.config.account);
        let publish = transfer(inner, "manifest publish", || {
            inner.store.put(&key, body.clone())
        })
        .await;

        match publish {
            Ok(()) => {
                manifest_version = published.version;
                for (shard_index, checksum, generation) in uploads {
                    inner
                        .catalog
                        .upload_acknowledged(shard_index, generation, checksum)
                        .await?;
                    info!(shard = format_args!("{shard_index:x}"), "shard uploaded");
                    outcomes[shard_index] = ShardOutcome::Uploaded;
                }
                // ETag unknown after a put; the next cycle re-fetches.
                *inner.cached_manifest.lock().await = Some(published);
            }
            Err(e) => {
                warn!(error = %e, "manifest publish failed");
                let reason = format!("manifest publish failed: {e}");
                for (shard_index, _, _) in uploads {
                    outcomes[shard_index] = ShardOutcome::Failed {
                        reason: reason.clone(),
                    };
                }
            }
        }
    }

    inner.catalog.persist().await?;

    Ok(SyncSummary {
        outcomes,
        manifest_version,
    })
}

/// Fetch the remote manifest, reusing the cached copy when the ETag matches.
async fn fetch_manifest(inner: &Arc<EngineInner>) -> CatalogResult<Manifest> {
    let key = manifest_key(&inner.config.account);

    let meta = match transfer(inner, "manifest head", || inner.store.head(&key)).await {
        Ok(meta) => meta,
        Err(CatalogError::Storage(StorageError::NotFound(_))) => {
            return Ok(Manifest::empty());
        }
        Err(e) => return Err(e),
    };

    if let Some(etag) = &meta.etag {
        let cached = inner.cached_manifest.lock().await;
        if let Some(manifest) = cached.as_ref() {
            if manifest.etag.as_deref() == Some(etag) {
                debug!(etag, "manifest unchanged, using cached copy");
                return Ok(manifest.clone());
            }
        }
    }

    let bytes = match transfer(inner, "manifest fetch", || inner.store.get(&key)).await {
        Ok(bytes) => bytes,
        // Deleted between head and get; treat as never uploaded.
        Err(CatalogError::Storage(StorageError::NotFound(_))) => {
            return Ok(Manifest::empty());
        }
        Err(e) => return Err(e),
    };
    let mut manifest = Manifest::from_json(&bytes)?;
    manifest.etag = meta.etag;
    *inner.cached_manifest.lock().await = Some(manifest.clone());
    Ok(manifest)
}

async fn download_shard(
    inner: &Arc<EngineInner>,
    shard_index: usize,
    expected: ContentDigest,
) -> CatalogResult<TaskOutcome> {
    let key = shard_key(&inner.config.account, shard_index);

    let mut bytes = transfer(inner, "shard download", || inner.store.get(&key)).await?;
    if ContentDigest::compute(&bytes) != expected {
        // One fresh download covers a torn read of an object replaced
        // mid-cycle; a second mismatch is real corruption.
        warn!(
            shard = format_args!("{shard_index:x}"),
            "shard checksum mismatch, re-downloading"
        );
        bytes = transfer(inner, "shard re-download", || inner.store.get(&key)).await?;
        let actual = ContentDigest::compute(&bytes);
        if actual != expected {
            return Err(CatalogError::Core(CoreError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            }));
        }
    }

    let entries = wire::decode_shard(shard_index, &bytes)?;
    let count = inner
        .catalog
        .import_shard(shard_index, entries, expected)
        .await?;
    Ok(TaskOutcome::Downloaded { entries: count })
}

async fn upload_shard(
    inner: &Arc<EngineInner>,
    shard_index: usize,
) -> CatalogResult<TaskOutcome> {
    let (bytes, generation) = inner.catalog.export_shard(shard_index).await?;
    let checksum = ContentDigest::compute(&bytes);
    let key = shard_key(&inner.config.account, shard_index);
    let body = Bytes::from(bytes);

    transfer(inner, "shard upload", || {
        inner.store.put(&key, body.clone())
    })
    .await?;
    Ok(TaskOutcome::UploadedPending {
        checksum,
        generation,
    })
}

/// Run a storage operation under the per-transfer timeout, retrying transient
/// failures with doubling backoff.
async fn transfer<T, F, Fut>(
    inner: &Arc<EngineInner>,
    operation: &str,
    op: F,
) -> CatalogResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = inner.config.transfer_attempts;
    let mut attempt = 1u32;
    loop {
        let error = match timeout(inner.config.transfer_timeout(), op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => CatalogError::from(e),
            Err(_) => CatalogError::TransferTimeout {
                operation: operation.to_string(),
            },
        };

        if attempt >= attempts || !error.is_transient() {
            return Err(error);
        }
        let backoff = inner.config.retry_backoff(attempt);
        debug!(operation, attempt, backoff_ms = backoff.as_millis() as u64, error = %error, "retrying transfer");
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}
