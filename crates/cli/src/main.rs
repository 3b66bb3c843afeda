//! Command-line interface for the Lightbox photo catalog.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use lightbox_cache::{DigestStore, IdentityKeyCache};
use lightbox_catalog::{ShardCatalog, ShardOutcome, SyncEngine};
use lightbox_core::config::AppConfig;
use lightbox_core::digest::ContentDigest;
use lightbox_core::entry::{CatalogEntry, LocalFields};
use lightbox_core::SHARD_COUNT;
use lightbox_storage::ObjectStore;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File extensions treated as photos.
const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

#[derive(Parser)]
#[command(name = "lightbox")]
#[command(about = "Personal photo catalog with checksum-delta cloud sync")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, env = "LIGHTBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory tree and catalog the photos in it
    Scan {
        /// Directory to scan
        directory: PathBuf,
    },
    /// Run one sync cycle against the configured remote
    Sync,
    /// Show catalog and sync state
    Status,
    /// Star or unstar a photo (local-only, survives sync)
    Star {
        /// Content digest of the photo (64 hex chars)
        digest: String,
        /// Remove the star instead of setting it
        #[arg(long, default_value_t = false)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { directory } => handle_scan(&config, &directory).await,
        Commands::Sync => handle_sync(&config).await,
        Commands::Status => handle_status(&config).await,
        Commands::Star { digest, remove } => handle_star(&config, &digest, remove).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.unwrap_or_else(|| Path::new("lightbox.toml"));

    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed("LIGHTBOX_").split("__"));

    let config: AppConfig = figment
        .extract()
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PHOTO_EXTENSIONS.iter().any(|p| e.eq_ignore_ascii_case(p)))
        .unwrap_or(false)
}

async fn handle_scan(config: &AppConfig, directory: &Path) -> Result<()> {
    let catalog = ShardCatalog::open(&config.catalog_root).await?;
    let identity = IdentityKeyCache::load(&config.cache).await?;
    let store = DigestStore::open(&config.cache).await?;

    let mut scanned = 0usize;
    let mut changed = 0usize;
    let mut skipped = 0usize;

    for walk_entry in WalkDir::new(directory) {
        let walk_entry = match walk_entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                skipped += 1;
                continue;
            }
        };
        if !walk_entry.file_type().is_file() || !is_photo(walk_entry.path()) {
            continue;
        }

        match scan_file(&catalog, &identity, &store, walk_entry.path()).await {
            Ok(was_change) => {
                scanned += 1;
                if was_change {
                    changed += 1;
                }
            }
            Err(e) => {
                warn!(path = %walk_entry.path().display(), error = %e, "skipping file");
                skipped += 1;
            }
        }
    }

    identity.flush().await?;
    catalog.persist().await?;

    let evicted = store.evict_older_than(config.cache.disk_ttl()).await?;

    println!("Scanned {scanned} photos: {changed} new or changed, {skipped} skipped");
    if evicted > 0 {
        println!("Evicted {evicted} idle thumbnail(s) from the disk cache");
    }
    println!("Catalog now holds {} entries", catalog.entry_count().await);
    Ok(())
}

/// Catalog one file. Returns whether the catalog's synced state changed.
async fn scan_file(
    catalog: &ShardCatalog,
    identity: &IdentityKeyCache,
    store: &DigestStore,
    path: &Path,
) -> Result<bool> {
    let metadata = tokio::fs::metadata(path).await?;
    let mtime = OffsetDateTime::from(metadata.modified()?);
    let mtime_secs = mtime.unix_timestamp();

    // Unchanged stat triple: skip rehashing. Read the file at most once.
    let mut original: Option<Bytes> = None;
    let digest = match identity.resolve(path, metadata.len(), mtime_secs).await {
        Some(digest) => digest,
        None => {
            let bytes = Bytes::from(tokio::fs::read(path).await?);
            let digest = ContentDigest::compute(&bytes);
            identity.store(path, metadata.len(), mtime_secs, digest).await;
            original = Some(bytes);
            digest
        }
    };

    let photo = match store.get(&digest).await? {
        Some(photo) => photo,
        None => {
            let bytes = match original {
                Some(bytes) => bytes,
                None => Bytes::from(tokio::fs::read(path).await?),
            };
            store.ingest(digest, bytes).await?
        }
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let entry = CatalogEntry {
        digest,
        filename,
        file_size: metadata.len(),
        photo_date: photo.metadata.taken_at.unwrap_or(mtime),
        modified_date: mtime,
        width: Some(photo.metadata.width),
        height: Some(photo.metadata.height),
        source_id: None,
        local: LocalFields::default(),
    };

    debug!(path = %path.display(), %digest, "cataloged");
    Ok(catalog.upsert(entry).await)
}

async fn handle_sync(config: &AppConfig) -> Result<()> {
    let catalog = ShardCatalog::open(&config.catalog_root).await?;
    let store = lightbox_storage::from_config(&config.storage).await?;
    store
        .health_check()
        .await
        .with_context(|| format!("{} backend is unreachable", store.backend_name()))?;
    let engine = SyncEngine::new(catalog, store, config.sync.clone())?;

    let summary = engine.sync().await?;

    println!("{:<6} {:<12} Detail", "Shard", "Outcome");
    println!("{}", "-".repeat(40));
    for (index, outcome) in summary.outcomes.iter().enumerate() {
        match outcome {
            ShardOutcome::Clean => println!("{index:<6x} {:<12}", "clean"),
            ShardOutcome::Downloaded { entries } => {
                println!("{index:<6x} {:<12} {entries} entries", "downloaded")
            }
            ShardOutcome::Uploaded => println!("{index:<6x} {:<12}", "uploaded"),
            ShardOutcome::Failed { reason } => {
                println!("{index:<6x} {:<12} {reason}", "FAILED")
            }
        }
    }
    println!("Manifest version: {}", summary.manifest_version);

    let failed = summary.failed_shards();
    if failed > 0 {
        anyhow::bail!("{failed} shard(s) failed to sync");
    }
    Ok(())
}

async fn handle_status(config: &AppConfig) -> Result<()> {
    let catalog = ShardCatalog::open(&config.catalog_root).await?;
    let identity = IdentityKeyCache::load(&config.cache).await?;

    let states = catalog.shard_states().await;
    let mut starred = 0usize;
    for shard_index in 0..SHARD_COUNT {
        starred += catalog
            .shard_entries(shard_index)
            .await?
            .iter()
            .filter(|e| e.local.starred)
            .count();
    }

    println!("{:<6} {:<8} {:<6} Last synced", "Shard", "Entries", "Dirty");
    println!("{}", "-".repeat(48));
    for (index, state) in states.iter().enumerate() {
        let last_synced = state
            .last_synced
            .map(|c| c.to_hex()[..12].to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{index:<6x} {:<8} {:<6} {last_synced}",
            state.entry_count, state.dirty
        );
    }

    let dirty = states.iter().filter(|s| s.dirty).count();
    println!();
    println!("Entries: {}", catalog.entry_count().await);
    println!("Starred: {starred}");
    println!("Dirty shards: {dirty}");
    println!("Identity cache: {} keys", identity.len().await);
    println!("Account: {}", config.sync.account);
    Ok(())
}

async fn handle_star(config: &AppConfig, digest: &str, remove: bool) -> Result<()> {
    let digest = ContentDigest::from_hex(digest).context("invalid digest")?;
    let catalog = ShardCatalog::open(&config.catalog_root).await?;

    if !catalog.set_starred(&digest, !remove).await {
        anyhow::bail!("no catalog entry with digest {digest}");
    }
    catalog.persist().await?;

    if remove {
        println!("Unstarred {digest}");
    } else {
        println!("Starred {digest}");
    }
    Ok(())
}
