// src/cache.rs
//! Two-tier TTL cache over a [`KeyValueStore`].
//!
//! The priority tier holds the top-ranked sources' records with a short TTL,
//! the full tier holds the whole merged result with a longer one. Expired
//! entries are kept: they are what a run falls back to when every live fetch
//! fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::ingest::ensure_metrics_described;
use crate::ingest::types::ContentRecord;
use crate::store::KeyValueStore;

/// Every cache key starts with this; source stats live outside it.
pub const CACHE_PREFIX: &str = "feeds:cache:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Priority,
    Full,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Priority => "priority",
            CacheTier::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub records: Vec<ContentRecord>,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Age at `now`; entries stamped in the future count as brand new.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What [`CacheManager::best_available`] found.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub tier: CacheTier,
    pub entry: CacheEntry,
    pub fresh: bool,
}

#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    priority_ttl: Duration,
    full_ttl: Duration,
    scope: Option<String>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, priority_ttl: Duration, full_ttl: Duration) -> Self {
        Self {
            store,
            priority_ttl,
            full_ttl,
            scope: None,
        }
    }

    /// Same store and TTLs, separate keys (used for category runs).
    pub fn scoped(&self, scope: &str) -> Self {
        let scope = scope.trim().to_ascii_lowercase();
        Self {
            store: Arc::clone(&self.store),
            priority_ttl: self.priority_ttl,
            full_ttl: self.full_ttl,
            scope: (!scope.is_empty()).then_some(scope),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn key_for(&self, tier: CacheTier) -> String {
        match &self.scope {
            Some(scope) => format!("{CACHE_PREFIX}{scope}:{}", tier.as_str()),
            None => format!("{CACHE_PREFIX}{}", tier.as_str()),
        }
    }

    pub fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Priority => self.priority_ttl,
            CacheTier::Full => self.full_ttl,
        }
    }

    /// Entry regardless of age.
    pub fn get(&self, tier: CacheTier) -> Option<CacheEntry> {
        let key = self.key_for(tier);
        let raw = self.store.get(&key)?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(target: "cache", error = ?e, key = %key, "unreadable cache entry ignored");
                None
            }
        }
    }

    pub fn get_fresh(&self, tier: CacheTier) -> Option<CacheEntry> {
        let now = Utc::now();
        self.get(tier)
            .filter(|e| e.age_at(now) < self.ttl(tier))
    }

    pub fn is_fresh(&self, tier: CacheTier) -> bool {
        self.is_fresh_at(tier, Utc::now())
    }

    pub fn is_fresh_at(&self, tier: CacheTier, now: DateTime<Utc>) -> bool {
        self.get(tier)
            .is_some_and(|e| e.age_at(now) < self.ttl(tier))
    }

    /// Replace a tier's entry. Returns whether it was stored; a failed write
    /// is never an error for the caller.
    pub fn set(&self, tier: CacheTier, records: &[ContentRecord]) -> bool {
        self.set_at(tier, records, Utc::now())
    }

    /// `set` with an explicit timestamp (imports, tests).
    pub fn set_at(&self, tier: CacheTier, records: &[ContentRecord], stored_at: DateTime<Utc>) -> bool {
        let key = self.key_for(tier);
        let entry = CacheEntry {
            key: key.clone(),
            records: records.to_vec(),
            stored_at,
        };
        let json = match serde_json::to_string(&entry) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(target: "cache", error = ?e, key = %key, "cache entry serialization failed");
                return false;
            }
        };

        if self.store.set(&key, &json) {
            tracing::debug!(target: "cache", key = %key, records = records.len(), "cache tier written");
            return true;
        }

        // one prune pass, one retry
        let pruned = self.prune_except(&key);
        if self.store.set(&key, &json) {
            tracing::debug!(target: "cache", key = %key, pruned, "cache tier written after prune");
            return true;
        }

        ensure_metrics_described();
        counter!("feeds_cache_write_dropped_total").increment(1);
        tracing::warn!(target: "cache", key = %key, pruned, "cache write dropped");
        false
    }

    /// Fallback lookup: fresh full, fresh priority, expired full, expired priority.
    pub fn best_available(&self) -> Option<CacheHit> {
        let now = Utc::now();
        let full = self.get(CacheTier::Full);
        let priority = self.get(CacheTier::Priority);

        let fresh = |tier: CacheTier, e: &CacheEntry| e.age_at(now) < self.ttl(tier);
        let order = [
            (CacheTier::Full, &full, true),
            (CacheTier::Priority, &priority, true),
            (CacheTier::Full, &full, false),
            (CacheTier::Priority, &priority, false),
        ];
        let hit = order.into_iter().find_map(|(tier, entry, want_fresh)| {
            let entry = entry.as_ref()?;
            let is_fresh = fresh(tier, entry);
            (is_fresh == want_fresh).then(|| CacheHit {
                tier,
                entry: entry.clone(),
                fresh: is_fresh,
            })
        });
        hit
    }

    /// Drop every cache entry in the store (all scopes). Source stats stay.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for key in self.store.keys() {
            if key.starts_with(CACHE_PREFIX) && self.store.remove(&key) {
                removed += 1;
            }
        }
        tracing::info!(target: "cache", removed, "cache cleared");
        removed
    }

    fn prune_except(&self, keep: &str) -> usize {
        let mut removed = 0;
        for key in self.store.keys() {
            if key != keep && key.starts_with(CACHE_PREFIX) && self.store.remove(&key) {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn rec(i: u32) -> ContentRecord {
        ContentRecord {
            id: format!("id{i}"),
            title: format!("Title {i}"),
            link: format!("https://e/{i}"),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, i).unwrap(),
            body: String::new(),
            image_url: None,
            author: None,
            source_name: "S".into(),
        }
    }

    fn manager(store: Arc<dyn KeyValueStore>) -> CacheManager {
        CacheManager::new(store, Duration::from_secs(30), Duration::from_secs(90))
    }

    #[test]
    fn set_get_and_freshness() {
        let c = manager(Arc::new(MemoryStore::new()));
        assert!(c.get(CacheTier::Full).is_none());
        assert!(!c.is_fresh(CacheTier::Full));

        assert!(c.set(CacheTier::Full, &[rec(1), rec(2)]));
        let e = c.get(CacheTier::Full).unwrap();
        assert_eq!(e.records.len(), 2);
        assert_eq!(e.key, "feeds:cache:full");
        assert!(c.is_fresh(CacheTier::Full));
        assert!(!c.is_fresh_at(CacheTier::Full, e.stored_at + chrono::Duration::seconds(90)));
        assert!(c.is_fresh_at(CacheTier::Full, e.stored_at + chrono::Duration::seconds(89)));
    }

    #[test]
    fn expired_entries_stay_readable() {
        let c = manager(Arc::new(MemoryStore::new()));
        let old = Utc::now() - chrono::Duration::seconds(200);
        c.set_at(CacheTier::Full, &[rec(1)], old);
        assert!(c.get_fresh(CacheTier::Full).is_none());
        assert_eq!(c.get(CacheTier::Full).unwrap().records.len(), 1);
    }

    #[test]
    fn best_available_order() {
        let c = manager(Arc::new(MemoryStore::new()));
        assert!(c.best_available().is_none());

        let stale = Utc::now() - chrono::Duration::seconds(500);
        c.set_at(CacheTier::Priority, &[rec(1)], stale);
        let hit = c.best_available().unwrap();
        assert_eq!((hit.tier, hit.fresh), (CacheTier::Priority, false));

        c.set_at(CacheTier::Full, &[rec(2)], stale);
        let hit = c.best_available().unwrap();
        assert_eq!((hit.tier, hit.fresh), (CacheTier::Full, false));

        c.set(CacheTier::Priority, &[rec(3)]);
        let hit = c.best_available().unwrap();
        assert_eq!((hit.tier, hit.fresh), (CacheTier::Priority, true));

        c.set(CacheTier::Full, &[rec(4)]);
        let hit = c.best_available().unwrap();
        assert_eq!((hit.tier, hit.fresh), (CacheTier::Full, true));
    }

    #[test]
    fn scopes_do_not_collide_and_clear_keeps_stats() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let c = manager(store.clone());
        let tech = c.scoped(" Tech ");
        assert_eq!(tech.key_for(CacheTier::Full), "feeds:cache:tech:full");

        c.set(CacheTier::Full, &[rec(1)]);
        tech.set(CacheTier::Full, &[rec(2), rec(3)]);
        assert_eq!(c.get(CacheTier::Full).unwrap().records.len(), 1);
        assert_eq!(tech.get(CacheTier::Full).unwrap().records.len(), 2);

        store.set("feeds:source_stats", "{}");
        assert_eq!(c.clear(), 2);
        assert!(tech.get(CacheTier::Full).is_none());
        assert_eq!(store.get("feeds:source_stats").as_deref(), Some("{}"));
    }

    #[test]
    fn write_failure_prunes_once_then_drops() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let probe = manager(store.clone());
        probe.set(CacheTier::Full, &[rec(1)]);
        let one_entry = store.get("feeds:cache:full").unwrap().len() + "feeds:cache:full".len();

        // room for roughly one entry: the second tier only fits after pruning
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(one_entry + 64));
        store.set("feeds:source_stats", "{}");
        let c = manager(store.clone());
        assert!(c.set(CacheTier::Priority, &[rec(1)]));
        assert!(c.set(CacheTier::Full, &[rec(2)]));
        assert!(c.get(CacheTier::Priority).is_none(), "priority pruned to make room");
        assert!(store.get("feeds:source_stats").is_some());

        // too large even after pruning: silently dropped
        let big: Vec<ContentRecord> = (0..20).map(rec).collect();
        assert!(!c.set(CacheTier::Full, &big));
        assert_eq!(c.get(CacheTier::Full).unwrap().records, vec![rec(2)]);
    }
}
