// tests/cache_store.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use feed_relay::{
    CacheManager, CacheTier, ContentRecord, FileStore, KeyValueStore, MemoryStore,
    SourceDescriptor, SourceManager,
};

fn rec(i: usize) -> ContentRecord {
    ContentRecord {
        id: format!("r{i}"),
        title: format!("Story number {i} with a reasonably long headline"),
        link: format!("https://cache.test/{i}"),
        published_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, i as u32, 0).unwrap(),
        body: "x".repeat(120),
        image_url: None,
        author: None,
        source_name: "Cache".into(),
    }
}

fn manager(store: Arc<dyn KeyValueStore>) -> CacheManager {
    CacheManager::new(store, Duration::from_secs(30), Duration::from_secs(90))
}

#[test]
fn file_store_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<ContentRecord> = (0..3).map(rec).collect();
    let sources = vec![SourceDescriptor::new("Wire", "https://wire.test/rss", None)];

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()));
        assert!(manager(store.clone()).set(CacheTier::Full, &records));
        let sm = SourceManager::new(sources.clone(), store);
        sm.record_success("Wire", 800);
        sm.record_failure("Wire");
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()));
    let cache = manager(store.clone());
    let entry = cache.get(CacheTier::Full).expect("persisted entry");
    assert_eq!(entry.records, records);
    assert!(cache.is_fresh(CacheTier::Full));
    assert!(cache.get(CacheTier::Priority).is_none());

    let sm = SourceManager::new(sources, store);
    let stats = sm.stats("Wire");
    assert_eq!(stats.consecutive_failures, 1);
    assert!(stats.last_success_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_backed_stats_written_from_async_tasks_are_durable_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let sources = vec![SourceDescriptor::new("Wire", "https://wire.test/rss", None)];
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()));
    assert!(store.writes_block());
    let sm = Arc::new(SourceManager::new(sources.clone(), store));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let sm = Arc::clone(&sm);
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                sm.record_failure("Wire");
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    let flusher = Arc::clone(&sm);
    tokio::task::spawn_blocking(move || flusher.flush()).await.unwrap();

    let reopened = SourceManager::new(sources, Arc::new(FileStore::new(dir.path())));
    assert_eq!(reopened.stats("Wire").consecutive_failures, 40);
    assert!(!MemoryStore::new().writes_block());
}

#[test]
fn corrupt_entry_reads_as_missing() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = manager(store.clone());
    assert!(store.set(&cache.key_for(CacheTier::Full), "{not json"));
    assert!(cache.get(CacheTier::Full).is_none());
    assert!(cache.best_available().is_none());
}

#[test]
fn full_quota_prunes_other_entries_before_giving_up() {
    let batch: Vec<ContentRecord> = (0..4).map(rec).collect();
    let one_entry = serde_json::to_string(&batch).unwrap().len();
    // room for one entry of this size, not two
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(one_entry + one_entry / 2));
    let cache = manager(store.clone());

    assert!(cache.set(CacheTier::Priority, &batch));
    assert!(cache.set(CacheTier::Full, &batch));
    assert!(cache.get(CacheTier::Priority).is_none(), "priority entry pruned");
    assert_eq!(cache.get(CacheTier::Full).unwrap().records.len(), 4);

    // larger than the whole quota: dropped, nothing else disturbed
    let huge: Vec<ContentRecord> = (0..40).map(rec).collect();
    assert!(!cache.set(CacheTier::Priority, &huge));
    assert!(cache.get(CacheTier::Priority).is_none());
}

#[test]
fn clear_removes_cache_keys_only() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = manager(store.clone());
    let scoped = cache.scoped("Tech");
    cache.set(CacheTier::Full, &[rec(1)]);
    scoped.set(CacheTier::Priority, &[rec(2)]);
    store.set("feeds:source_stats", "{}");

    assert_eq!(scoped.key_for(CacheTier::Priority), "feeds:cache:tech:priority");
    assert_eq!(cache.clear(), 2);
    assert_eq!(store.keys(), vec!["feeds:source_stats".to_string()]);
}
