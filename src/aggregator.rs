// src/aggregator.rs
//! Progressive aggregation: priority tier first, then the remaining sources
//! in fixed-size batches, with a snapshot pushed to the caller's sink after
//! each step.
//!
//! Phases: `Idle → PriorityFetch → MainFetchBatching → Complete`, or
//! `Failed` when nothing live and nothing cached could be produced. Even
//! then the run resolves to an (empty) list; no error reaches the sink or the
//! caller.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cache::{CacheManager, CacheTier};
use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::ingest::ensure_metrics_described;
use crate::ingest::fetcher::ProxyFetcher;
use crate::ingest::relay::{HttpTransport, RelayTransport};
use crate::ingest::types::{ContentRecord, SourceDescriptor};
use crate::merge::merge_into;
use crate::rate_limit::RateLimiter;
use crate::source_stats::SourceManager;
use crate::store::{FileStore, KeyValueStore, MemoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    PriorityFetch,
    MainFetchBatching,
    Complete,
    Failed,
}

/// Receives snapshots of the accumulated records. Called several times per
/// run with a growing set; the last call has `is_complete == true`.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, records: &[ContentRecord], is_complete: bool);
}

impl<F> ProgressSink for F
where
    F: Fn(&[ContentRecord], bool) + Send + Sync,
{
    fn on_progress(&self, records: &[ContentRecord], is_complete: bool) {
        self(records, is_complete)
    }
}

/// Ignores every snapshot.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_progress(&self, _records: &[ContentRecord], _is_complete: bool) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub records: Vec<ContentRecord>,
    pub is_complete: bool,
}

/// Forwards snapshots into an unbounded channel; a closed receiver is ignored.
pub struct ChannelSink(pub mpsc::UnboundedSender<Snapshot>);

impl ProgressSink for ChannelSink {
    fn on_progress(&self, records: &[ContentRecord], is_complete: bool) {
        let _ = self.0.send(Snapshot {
            records: records.to_vec(),
            is_complete,
        });
    }
}

/// How a run ended, beyond the records themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every attempted source delivered.
    Complete,
    /// Some sources failed, others delivered.
    Partial,
    /// Nothing was fetched live; records come from a fresh cache tier.
    Cached,
    /// No live fetch delivered and the records come from the cache fallback,
    /// or an expired entry had to be served.
    Degraded,
    /// No records at all.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateOutcome {
    pub records: Vec<ContentRecord>,
    pub status: RunStatus,
    pub phase: Phase,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tier merged in by the total-failure fallback, if any.
    pub fallback: Option<CacheTier>,
    /// Whether that fallback entry was past its TTL.
    pub fallback_stale: bool,
}

#[derive(Debug, Default)]
struct Tally {
    attempted: usize,
    succeeded: usize,
    failed: usize,
}

pub struct ProgressiveAggregator {
    cfg: EngineConfig,
    sources: Arc<SourceManager>,
    fetcher: ProxyFetcher,
    limiter: RateLimiter,
    cache: CacheManager,
    // shared by every run; see `phase()`
    phase: Mutex<Phase>,
}

impl ProgressiveAggregator {
    pub fn new(
        cfg: EngineConfig,
        sources: Vec<SourceDescriptor>,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let manager = Arc::new(SourceManager::new(sources, Arc::clone(&store)));
        let fetcher = ProxyFetcher::new(&cfg, transport, Arc::clone(&manager));
        let cache = CacheManager::new(store, cfg.priority_ttl(), cfg.full_ttl());
        Self {
            limiter: RateLimiter::new(cfg.max_concurrent),
            cfg,
            sources: manager,
            fetcher,
            cache,
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Production wiring: reqwest transport, file store when `cache_dir` is set.
    pub fn from_config(cfg: EngineConfig, sources: Vec<SourceDescriptor>) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &cfg.cache_dir {
            Some(dir) => Arc::new(FileStore::new(dir.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        let transport: Arc<dyn RelayTransport> = Arc::new(HttpTransport::new(&cfg.user_agent)?);
        Ok(Self::new(cfg, sources, store, transport))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn source_manager(&self) -> &Arc<SourceManager> {
        &self.sources
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Phase last written by any run on this aggregator. Overlapping runs
    /// (say `run` and `aggregate_category` at once) share this cell; the
    /// per-run result is [`AggregateOutcome::phase`].
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, p: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = p;
    }

    /// Run over all sources and return the final merged list.
    pub async fn aggregate<S: ProgressSink + ?Sized>(&self, sink: &S) -> Vec<ContentRecord> {
        self.run(sink).await.records
    }

    /// Like [`aggregate`](Self::aggregate) but with the run report.
    pub async fn run<S: ProgressSink + ?Sized>(&self, sink: &S) -> AggregateOutcome {
        let ranked = self.sources.ranked_sources();
        self.run_over(ranked, &self.cache, "all", sink).await
    }

    /// Same state machine restricted to one category, with its own cache scope.
    pub async fn aggregate_category<S: ProgressSink + ?Sized>(
        &self,
        category: &str,
        sink: &S,
    ) -> AggregateOutcome {
        let ranked: Vec<SourceDescriptor> = self
            .sources
            .ranked_sources()
            .into_iter()
            .filter(|s| s.in_category(category))
            .collect();
        if ranked.is_empty() {
            tracing::warn!(target: "aggregate", category, "no sources in category");
        }
        let cache = self.cache.scoped(category);
        self.run_over(ranked, &cache, category, sink).await
    }

    /// Diagnostic single-source fetch, bypassing ranking, batching and cache.
    pub async fn probe_source(&self, name: &str) -> Vec<ContentRecord> {
        match self.sources.find(name) {
            Some(source) => self.fetcher.fetch(source).await,
            None => {
                tracing::warn!(target: "aggregate", source = name, "probe: unknown source");
                Vec::new()
            }
        }
    }

    /// Like [`probe_source`](Self::probe_source) but surfaces the typed error
    /// and does not touch source stats.
    pub async fn probe_source_detailed(&self, name: &str) -> Result<Vec<ContentRecord>, FetchError> {
        let source = self
            .sources
            .find(name)
            .ok_or_else(|| FetchError::UnknownSource(name.to_string()))?;
        self.fetcher.try_fetch(source).await
    }

    async fn run_over<S: ProgressSink + ?Sized>(
        &self,
        ranked: Vec<SourceDescriptor>,
        cache: &CacheManager,
        scope: &str,
        sink: &S,
    ) -> AggregateOutcome {
        ensure_metrics_described();
        let started = Instant::now();
        self.set_phase(Phase::PriorityFetch);

        let now = Utc::now();
        let (live, vetoed): (Vec<SourceDescriptor>, Vec<SourceDescriptor>) = ranked
            .into_iter()
            .partition(|s| !self.sources.should_skip_at(&s.name, now));
        if !vetoed.is_empty() {
            counter!("feeds_sources_skipped_total").increment(vetoed.len() as u64);
            for s in &vetoed {
                tracing::debug!(target: "aggregate", source = %s.name, "skipping unreliable source");
            }
        }

        let k = self.cfg.priority_sources.min(live.len());
        let (priority, rest) = live.split_at(k);
        let mut acc: Vec<ContentRecord> = Vec::new();
        let mut tally = Tally::default();

        // --- priority tier ---
        match cache.get_fresh(CacheTier::Priority) {
            Some(entry) => {
                merge_into(&mut acc, &entry.records);
                tracing::debug!(
                    target: "aggregate",
                    scope,
                    records = acc.len(),
                    "priority tier served from cache"
                );
            }
            None => {
                let results = self.fetch_batch(priority, &mut tally).await;
                for r in &results {
                    merge_into(&mut acc, r);
                }
                if tally.succeeded > 0 {
                    cache.set(CacheTier::Priority, &acc);
                }
            }
        }
        sink.on_progress(&acc, false);

        // --- remaining sources ---
        self.set_phase(Phase::MainFetchBatching);
        let mut fallback: Option<CacheHitInfo> = None;
        let batches: Vec<&[SourceDescriptor]> = rest.chunks(self.cfg.batch_size.max(1)).collect();
        if batches.is_empty() {
            fallback = settle(&mut acc, &tally, cache);
            sink.on_progress(&acc, true);
        }
        for (i, batch) in batches.iter().enumerate() {
            let results = self.fetch_batch(batch, &mut tally).await;
            let mut added = 0;
            for r in &results {
                added += merge_into(&mut acc, r);
            }
            let last = i + 1 == batches.len();
            if last {
                fallback = settle(&mut acc, &tally, cache);
            }
            tracing::debug!(
                target: "aggregate",
                scope,
                batch = i + 1,
                of = batches.len(),
                added,
                total = acc.len(),
                "batch merged"
            );
            sink.on_progress(&acc, last);
        }

        if tally.succeeded > 0 {
            cache.set(CacheTier::Full, &acc);
        }

        let status = classify(&acc, &tally, fallback);
        let phase = if acc.is_empty() {
            Phase::Failed
        } else {
            Phase::Complete
        };
        self.set_phase(phase);
        gauge!("feeds_aggregate_last_run_ts").set(Utc::now().timestamp() as f64);

        tracing::info!(
            target: "aggregate",
            scope,
            status = ?status,
            records = acc.len(),
            attempted = tally.attempted,
            succeeded = tally.succeeded,
            failed = tally.failed,
            skipped = vetoed.len(),
            fallback = ?fallback.map(|f| f.tier),
            fallback_stale = fallback.is_some_and(|f| !f.fresh),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation finished"
        );

        AggregateOutcome {
            records: acc,
            status,
            phase,
            attempted: tally.attempted,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: vetoed.len(),
            fallback: fallback.map(|f| f.tier),
            fallback_stale: fallback.is_some_and(|f| !f.fresh),
        }
    }

    /// Fetch a group of sources concurrently, gated by the rate limiter.
    /// Results come back in the group's order.
    async fn fetch_batch(
        &self,
        batch: &[SourceDescriptor],
        tally: &mut Tally,
    ) -> Vec<Vec<ContentRecord>> {
        let results = join_all(
            batch
                .iter()
                .map(|s| self.limiter.run(self.fetcher.fetch(s))),
        )
        .await;
        for r in &results {
            tally.attempted += 1;
            if r.is_empty() {
                tally.failed += 1;
            } else {
                tally.succeeded += 1;
            }
        }
        results
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheHitInfo {
    tier: CacheTier,
    fresh: bool,
}

/// Total-failure fallback: with no live success (after trying something, or
/// with nothing to show at all) merge in the best cache entry, stale or not.
fn settle(acc: &mut Vec<ContentRecord>, tally: &Tally, cache: &CacheManager) -> Option<CacheHitInfo> {
    if tally.succeeded > 0 || (tally.attempted == 0 && !acc.is_empty()) {
        return None;
    }
    let hit = cache.best_available()?;
    let added = merge_into(acc, &hit.entry.records);
    tracing::info!(
        target: "aggregate",
        tier = hit.tier.as_str(),
        fresh = hit.fresh,
        added,
        "serving cached records"
    );
    Some(CacheHitInfo {
        tier: hit.tier,
        fresh: hit.fresh,
    })
}

fn classify(records: &[ContentRecord], tally: &Tally, fallback: Option<CacheHitInfo>) -> RunStatus {
    if records.is_empty() {
        RunStatus::Empty
    } else if fallback.is_some_and(|f| !f.fresh) {
        RunStatus::Degraded
    } else if tally.attempted == 0 {
        RunStatus::Cached
    } else if tally.succeeded == 0 {
        RunStatus::Degraded
    } else if tally.failed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Complete
    }
}
