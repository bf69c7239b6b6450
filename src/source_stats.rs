//! # Source Stats
//!
//! Per-source reliability bookkeeping and ranking.
//!
//! - Every fetch outcome nudges the source's `SourceStats`
//!   (success rate, running latency, failure streak).
//! - `ranked_sources()` orders the configured list by a composite score,
//!   keeping configured order for ties so batch partitioning is reproducible.
//! - Chronically failing sources are vetoed by `should_skip()`.
//! - Stats are persisted through a [`KeyValueStore`] after every mutation and
//!   read back on construction; unknown sources start from neutral defaults.
//!   Writes to a blocking store run on tokio's blocking pool, and a versioned
//!   snapshot never overwrites a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::types::SourceDescriptor;
use crate::store::KeyValueStore;

/// Store key holding the serialized stats map.
pub const STATS_KEY: &str = "feeds:source_stats";

const NEUTRAL_SUCCESS_RATE: f64 = 0.5;
const NEUTRAL_RESPONSE_MS: f64 = 5_000.0;
const SUCCESS_STEP: f64 = 0.1;
const FAILURE_STEP: f64 = 0.2;
const SKIP_RATE_BELOW: f64 = 0.1;
const SKIP_FAILURES_ABOVE: u32 = 3;
const SKIP_QUIET_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceStats {
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for SourceStats {
    fn default() -> Self {
        Self {
            success_rate: NEUTRAL_SUCCESS_RATE,
            avg_response_time_ms: NEUTRAL_RESPONSE_MS,
            last_success_at: None,
            consecutive_failures: 0,
        }
    }
}

impl SourceStats {
    /// `success_rate − avg_ms / 10000 − failures × 0.1`
    pub fn score(&self) -> f64 {
        self.success_rate
            - self.avg_response_time_ms / 10_000.0
            - f64::from(self.consecutive_failures) * 0.1
    }

    /// Never having succeeded counts as "last success infinitely long ago".
    pub fn is_skippable_at(&self, now: DateTime<Utc>) -> bool {
        let quiet_long_enough = match self.last_success_at {
            Some(t) => now - t > Duration::minutes(SKIP_QUIET_MINUTES),
            None => true,
        };
        self.success_rate < SKIP_RATE_BELOW
            && self.consecutive_failures > SKIP_FAILURES_ABOVE
            && quiet_long_enough
    }

    pub fn apply_success(&mut self, elapsed_ms: f64, at: DateTime<Utc>) {
        self.success_rate = clamp01(self.success_rate + SUCCESS_STEP);
        self.avg_response_time_ms = (self.avg_response_time_ms + elapsed_ms.max(0.0)) / 2.0;
        self.last_success_at = Some(at);
        self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
    }

    pub fn apply_failure(&mut self) {
        self.success_rate = clamp01(self.success_rate - FAILURE_STEP);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// One row of [`SourceManager::health_report`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: SourceDescriptor,
    pub stats: SourceStats,
    pub score: f64,
    pub skippable: bool,
}

#[derive(Debug, Default)]
struct StatsTable {
    map: HashMap<String, SourceStats>,
    version: u64,
}

/// Owns the configured source list and the mutable stats map.
///
/// Fetch completions land from many tasks at once, so the map sits behind a
/// mutex. A mutation snapshots the map under the lock; the store write
/// happens after the lock is released.
pub struct SourceManager {
    sources: Vec<SourceDescriptor>,
    stats: Mutex<StatsTable>,
    store: Arc<dyn KeyValueStore>,
    // highest table version that reached the store
    persisted: Arc<Mutex<u64>>,
}

impl SourceManager {
    pub fn new(sources: Vec<SourceDescriptor>, store: Arc<dyn KeyValueStore>) -> Self {
        let stats = load_stats(store.as_ref());
        tracing::debug!(
            target: "sources",
            configured = sources.len(),
            persisted = stats.len(),
            "source manager ready"
        );
        Self {
            sources,
            stats: Mutex::new(StatsTable {
                map: stats,
                version: 0,
            }),
            store,
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn find(&self, name: &str) -> Option<&SourceDescriptor> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .or_else(|| self.sources.iter().find(|s| s.name.eq_ignore_ascii_case(name.trim())))
    }

    /// Current stats, neutral defaults for sources never seen.
    pub fn stats(&self, name: &str) -> SourceStats {
        let table = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        table.map.get(name).copied().unwrap_or_default()
    }

    /// Overwrite a source's stats (seeding, tests, imports).
    pub fn set_stats(&self, name: &str, stats: SourceStats) {
        self.mutate(name, |s| *s = stats);
    }

    /// Configured sources, stable-sorted by descending score.
    pub fn ranked_sources(&self) -> Vec<SourceDescriptor> {
        let table = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(f64, &SourceDescriptor)> = self
            .sources
            .iter()
            .map(|s| (table.map.get(&s.name).copied().unwrap_or_default().score(), s))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn should_skip(&self, name: &str) -> bool {
        self.should_skip_at(name, Utc::now())
    }

    pub fn should_skip_at(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.stats(name).is_skippable_at(now)
    }

    pub fn record_success(&self, name: &str, elapsed_ms: u64) {
        let now = Utc::now();
        let updated = self.mutate(name, |s| s.apply_success(elapsed_ms as f64, now));
        tracing::debug!(
            target: "sources",
            source = name,
            elapsed_ms,
            success_rate = updated.success_rate,
            "fetch success recorded"
        );
    }

    pub fn record_failure(&self, name: &str) {
        let updated = self.mutate(name, SourceStats::apply_failure);
        if updated.is_skippable_at(Utc::now()) {
            tracing::info!(
                target: "sources",
                source = name,
                failures = updated.consecutive_failures,
                success_rate = updated.success_rate,
                "source is now skippable"
            );
        } else {
            tracing::debug!(
                target: "sources",
                source = name,
                failures = updated.consecutive_failures,
                success_rate = updated.success_rate,
                "fetch failure recorded"
            );
        }
    }

    /// Restore neutral stats for one source.
    pub fn reset(&self, name: &str) {
        self.mutate(name, |s| *s = SourceStats::default());
        tracing::info!(target: "sources", source = name, "source stats reset");
    }

    /// Every configured source with its stats, score and skip flag, ranked.
    pub fn health_report(&self) -> Vec<SourceHealth> {
        let now = Utc::now();
        self.ranked_sources()
            .into_iter()
            .map(|source| {
                let stats = self.stats(&source.name);
                SourceHealth {
                    score: stats.score(),
                    skippable: stats.is_skippable_at(now),
                    stats,
                    source,
                }
            })
            .collect()
    }

    /// Write the current stats synchronously. Blocks; call it from
    /// `spawn_blocking` inside a runtime.
    pub fn flush(&self) {
        let (version, json) = self.snapshot();
        match json {
            Ok(json) => write_snapshot(self.store.as_ref(), &self.persisted, version, &json),
            Err(e) => tracing::warn!(target: "sources", error = ?e, "source stats serialization failed"),
        }
    }

    fn snapshot(&self) -> (u64, serde_json::Result<String>) {
        let table = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        (table.version, serde_json::to_string(&table.map))
    }

    fn mutate(&self, name: &str, f: impl FnOnce(&mut SourceStats)) -> SourceStats {
        let (updated, version, json) = {
            let mut table = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = table.map.entry(name.to_string()).or_default();
            f(entry);
            let updated = *entry;
            table.version += 1;
            (updated, table.version, serde_json::to_string(&table.map))
        };
        match json {
            Ok(json) => self.persist(version, json),
            Err(e) => tracing::warn!(target: "sources", error = ?e, "source stats serialization failed"),
        }
        updated
    }

    fn persist(&self, version: u64, json: String) {
        let store = Arc::clone(&self.store);
        let persisted = Arc::clone(&self.persisted);
        let write = move || write_snapshot(store.as_ref(), &persisted, version, &json);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if self.store.writes_block() => {
                handle.spawn_blocking(write);
            }
            _ => write(),
        }
    }
}

fn load_stats(store: &dyn KeyValueStore) -> HashMap<String, SourceStats> {
    let Some(raw) = store.get(STATS_KEY) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, SourceStats>>(&raw) {
        Ok(mut map) => {
            for s in map.values_mut() {
                s.success_rate = clamp01(s.success_rate);
                if !s.avg_response_time_ms.is_finite() || s.avg_response_time_ms < 0.0 {
                    s.avg_response_time_ms = NEUTRAL_RESPONSE_MS;
                }
            }
            map
        }
        Err(e) => {
            tracing::warn!(target: "sources", error = ?e, "discarding unreadable source stats");
            HashMap::new()
        }
    }
}

/// Store one serialized snapshot unless a newer version already landed.
fn write_snapshot(store: &dyn KeyValueStore, persisted: &Mutex<u64>, version: u64, json: &str) {
    let mut last = persisted.lock().unwrap_or_else(PoisonError::into_inner);
    if version <= *last {
        return;
    }
    if store.set(STATS_KEY, json) {
        *last = version;
    } else {
        tracing::warn!(target: "sources", version, "source stats not persisted");
    }
}

#[inline]
fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return NEUTRAL_SUCCESS_RATE;
    }
    x.clamp(0.0, 1.0)
}
