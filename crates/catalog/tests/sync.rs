//! End-to-end sync engine tests against the in-memory store.

mod common;

use common::{
    entry_for_shard, entry_for_shard_nth, test_sync_config, CountingStore, FlakyStore,
    TamperStore,
};
use lightbox_catalog::{ShardCatalog, ShardOutcome, SyncEngine};
use lightbox_storage::{MemoryBackend, ObjectStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

async fn engine_at(
    dir: &std::path::Path,
    store: Arc<dyn ObjectStore>,
) -> (ShardCatalog, SyncEngine) {
    let catalog = ShardCatalog::open(dir).await.unwrap();
    let engine = SyncEngine::new(catalog.clone(), store, test_sync_config()).unwrap();
    (catalog, engine)
}

#[tokio::test]
async fn test_empty_catalogs_sync_clean() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let (_, engine) = engine_at(dir.path(), store).await;

    let summary = engine.sync().await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.manifest_version, 0);
}

#[tokio::test]
async fn test_first_sync_uploads_then_clean() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let (catalog, engine) = engine_at(dir.path(), store).await;

    catalog.upsert(entry_for_shard(4, "a.jpg")).await;
    catalog.upsert(entry_for_shard(9, "b.jpg")).await;

    let summary = engine.sync().await.unwrap();
    assert_eq!(summary.outcomes[4], ShardOutcome::Uploaded);
    assert_eq!(summary.outcomes[9], ShardOutcome::Uploaded);
    assert_eq!(summary.failed_shards(), 0);
    assert_eq!(summary.manifest_version, 1);

    let again = engine.sync().await.unwrap();
    assert!(again.is_clean());
    assert_eq!(again.manifest_version, 1);
}

#[tokio::test]
async fn test_second_device_downloads() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());

    let dir_a = tempfile::tempdir().unwrap();
    let (catalog_a, engine_a) = engine_at(dir_a.path(), store.clone()).await;
    let entry = entry_for_shard(6, "shared.jpg");
    catalog_a.upsert(entry.clone()).await;
    engine_a.sync().await.unwrap();

    let dir_b = tempfile::tempdir().unwrap();
    let (catalog_b, engine_b) = engine_at(dir_b.path(), store).await;
    let summary = engine_b.sync().await.unwrap();

    assert_eq!(summary.outcomes[6], ShardOutcome::Downloaded { entries: 1 });
    let fetched = catalog_b.get(&entry.digest).await.unwrap();
    assert!(fetched.synced_eq(&entry));
}

#[tokio::test]
async fn test_remote_wins_but_local_fields_survive() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let shard = 1;

    // Device 1 publishes A.
    let dir_1 = tempfile::tempdir().unwrap();
    let (catalog_1, engine_1) = engine_at(dir_1.path(), store.clone()).await;
    let a = entry_for_shard_nth(shard, 0, "a.jpg");
    catalog_1.upsert(a.clone()).await;
    engine_1.sync().await.unwrap();

    // Device 2 pulls A, stars it, and adds B without syncing.
    let dir_2 = tempfile::tempdir().unwrap();
    let (catalog_2, engine_2) = engine_at(dir_2.path(), store.clone()).await;
    engine_2.sync().await.unwrap();
    catalog_2.set_starred(&a.digest, true).await;
    let b = entry_for_shard_nth(shard, 1, "b.jpg");
    catalog_2.upsert(b.clone()).await;

    // Device 1 adds C and publishes; the remote now holds A and C.
    let c = entry_for_shard_nth(shard, 2, "c.jpg");
    catalog_1.upsert(c.clone()).await;
    engine_1.sync().await.unwrap();

    // Device 2's shard is dirty AND the remote changed: remote wins.
    let summary = engine_2.sync().await.unwrap();
    assert_eq!(
        summary.outcomes[shard],
        ShardOutcome::Downloaded { entries: 2 }
    );

    let merged_a = catalog_2.get(&a.digest).await.unwrap();
    assert!(merged_a.local.starred, "starred flag must survive the import");
    assert!(catalog_2.get(&c.digest).await.is_some(), "C imported");
    assert!(catalog_2.get(&b.digest).await.is_none(), "B dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_syncs_share_one_cycle() {
    let memory: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let counting = Arc::new(CountingStore::new(memory, Duration::from_millis(20)));
    let store: Arc<dyn ObjectStore> = counting.clone();

    let dir = tempfile::tempdir().unwrap();
    let (catalog, engine) = engine_at(dir.path(), store).await;
    catalog.upsert(entry_for_shard(3, "a.jpg")).await;

    let (first, second) = tokio::join!(engine.sync(), engine.sync());
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(Arc::ptr_eq(&first, &second), "joiners get the same summary");
    // One shard put plus one manifest put; a second cycle would double this.
    assert_eq!(counting.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unchanged_manifest_is_not_refetched() {
    let memory: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let counting = Arc::new(CountingStore::new(memory, Duration::from_millis(1)));
    let store: Arc<dyn ObjectStore> = counting.clone();

    let dir = tempfile::tempdir().unwrap();
    let (catalog, engine) = engine_at(dir.path(), store).await;
    catalog.upsert(entry_for_shard(0, "a.jpg")).await;
    engine.sync().await.unwrap();

    // First clean cycle re-fetches (the publish invalidated the cached ETag)...
    engine.sync().await.unwrap();
    let gets_after_second = counting.gets.load(Ordering::SeqCst);

    // ...the next one hits the ETag short-circuit and reads nothing.
    engine.sync().await.unwrap();
    assert_eq!(counting.gets.load(Ordering::SeqCst), gets_after_second);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let memory: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let store: Arc<dyn ObjectStore> = Arc::new(FlakyStore::new(memory, 1, 1));

    let dir = tempfile::tempdir().unwrap();
    let (catalog, engine) = engine_at(dir.path(), store).await;
    catalog.upsert(entry_for_shard(5, "a.jpg")).await;

    let summary = engine.sync().await.unwrap();
    assert_eq!(summary.outcomes[5], ShardOutcome::Uploaded);
    assert_eq!(summary.failed_shards(), 0);
}

#[tokio::test]
async fn test_one_bad_read_recovers_by_redownload() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());

    let dir_1 = tempfile::tempdir().unwrap();
    let (catalog_1, engine_1) = engine_at(dir_1.path(), store.clone()).await;
    catalog_1.upsert(entry_for_shard(2, "a.jpg")).await;
    engine_1.sync().await.unwrap();

    let tampering: Arc<dyn ObjectStore> =
        Arc::new(TamperStore::new(store, "shards/2.csv", 1));
    let dir_2 = tempfile::tempdir().unwrap();
    let (_, engine_2) = engine_at(dir_2.path(), tampering).await;

    let summary = engine_2.sync().await.unwrap();
    assert_eq!(summary.outcomes[2], ShardOutcome::Downloaded { entries: 1 });
}

#[tokio::test]
async fn test_persistent_corruption_fails_only_that_shard() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());

    let dir_1 = tempfile::tempdir().unwrap();
    let (catalog_1, engine_1) = engine_at(dir_1.path(), store.clone()).await;
    let poisoned = entry_for_shard(2, "poisoned.jpg");
    let healthy = entry_for_shard(11, "healthy.jpg");
    catalog_1.upsert(poisoned.clone()).await;
    catalog_1.upsert(healthy.clone()).await;
    engine_1.sync().await.unwrap();

    let tampering: Arc<dyn ObjectStore> =
        Arc::new(TamperStore::new(store, "shards/2.csv", u32::MAX));
    let dir_2 = tempfile::tempdir().unwrap();
    let (catalog_2, engine_2) = engine_at(dir_2.path(), tampering).await;

    let summary = engine_2.sync().await.unwrap();
    match &summary.outcomes[2] {
        ShardOutcome::Failed { reason } => {
            assert!(reason.contains("checksum"), "unexpected reason: {reason}")
        }
        other => panic!("expected shard 2 to fail, got {other:?}"),
    }
    assert_eq!(summary.outcomes[11], ShardOutcome::Downloaded { entries: 1 });

    // The corrupt bytes never reached the local catalog.
    assert!(catalog_2.get(&poisoned.digest).await.is_none());
    assert!(catalog_2.get(&healthy.digest).await.is_some());
}

#[tokio::test]
async fn test_sync_state_survives_restart() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();

    {
        let (catalog, engine) = engine_at(dir.path(), store.clone()).await;
        catalog.upsert(entry_for_shard(8, "a.jpg")).await;
        engine.sync().await.unwrap();
    }

    // A fresh process over the same catalog root sees nothing to do.
    let (catalog, engine) = engine_at(dir.path(), store).await;
    assert_eq!(catalog.entry_count().await, 1);
    let summary = engine.sync().await.unwrap();
    assert!(summary.is_clean());
}
