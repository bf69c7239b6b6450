// src/ingest/fetcher.rs
//! Pulls one source through the relay pool.
//!
//! Relays are raced in waves: the pool is rotated by one per fetch, cut into
//! groups of `race_width`, and every relay of a group is requested at once.
//! The first response that validates, sanitizes and parses into linked
//! records wins; the rest of the wave is dropped. When a whole wave fails the
//! next one starts after `wave_delay`. A per-request timeout bounds each
//! attempt and `source_timeout` bounds the whole fetch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::ingest::ensure_metrics_described;
use crate::ingest::parser::FeedParser;
use crate::ingest::relay::{RelayEndpoint, RelayTransport};
use crate::ingest::sanitize::{sanitize_feed_text, validate_feed_shape};
use crate::ingest::types::{ContentRecord, SourceDescriptor};
use crate::source_stats::SourceManager;

pub struct ProxyFetcher {
    transport: Arc<dyn RelayTransport>,
    relays: Vec<RelayEndpoint>,
    parser: FeedParser,
    sources: Arc<SourceManager>,
    request_timeout: Duration,
    source_timeout: Duration,
    race_width: usize,
    wave_delay: Duration,
    rotation: AtomicUsize,
}

impl ProxyFetcher {
    pub fn new(
        cfg: &EngineConfig,
        transport: Arc<dyn RelayTransport>,
        sources: Arc<SourceManager>,
    ) -> Self {
        let request_timeout = cfg.request_timeout();
        Self {
            transport,
            relays: cfg.relays.clone(),
            parser: FeedParser::new(
                cfg.max_items_per_source,
                cfg.max_title_chars,
                cfg.max_body_chars,
            ),
            sources,
            request_timeout,
            source_timeout: cfg.source_timeout().max(request_timeout),
            race_width: cfg.race_width.max(1),
            wave_delay: cfg.wave_delay(),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn relays(&self) -> &[RelayEndpoint] {
        &self.relays
    }

    pub fn source_manager(&self) -> &Arc<SourceManager> {
        &self.sources
    }

    /// Fetch one source. Never fails: errors are logged, counted and reported
    /// to the source manager, and the caller gets an empty list.
    pub async fn fetch(&self, source: &SourceDescriptor) -> Vec<ContentRecord> {
        ensure_metrics_described();
        let t0 = Instant::now();

        match self.try_fetch(source).await {
            Ok(records) => {
                let ms = t0.elapsed().as_millis() as u64;
                self.sources.record_success(&source.name, ms);
                counter!("feeds_fetch_success_total").increment(1);
                histogram!("feeds_fetch_ms").record(ms as f64);
                tracing::debug!(
                    target: "fetch",
                    source = %source.name,
                    records = records.len(),
                    elapsed_ms = ms,
                    "source fetched"
                );
                records
            }
            Err(e) => {
                self.sources.record_failure(&source.name);
                counter!("feeds_fetch_failure_total", "kind" => e.kind().as_str()).increment(1);
                histogram!("feeds_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                tracing::warn!(
                    target: "fetch",
                    source = %source.name,
                    kind = e.kind().as_str(),
                    error = %e,
                    "source fetch failed"
                );
                Vec::new()
            }
        }
    }

    /// Same pipeline as [`fetch`](Self::fetch) but returns the typed error and
    /// leaves source stats untouched.
    pub async fn try_fetch(&self, source: &SourceDescriptor) -> Result<Vec<ContentRecord>, FetchError> {
        if self.relays.is_empty() {
            return Err(FetchError::NoRelays);
        }
        tokio::time::timeout(self.source_timeout, self.race_relays(source))
            .await
            .map_err(|_| FetchError::Deadline(self.source_timeout))?
    }

    /// Relay order for the next fetch: the pool rotated by a per-fetch offset.
    fn next_rotation(&self) -> Vec<RelayEndpoint> {
        let n = self.relays.len();
        let start = self.rotation.fetch_add(1, Ordering::Relaxed) % n;
        self.relays[start..]
            .iter()
            .chain(self.relays[..start].iter())
            .cloned()
            .collect()
    }

    async fn race_relays(&self, source: &SourceDescriptor) -> Result<Vec<ContentRecord>, FetchError> {
        let order = self.next_rotation();
        let mut attempts = 0usize;
        let mut last: Option<FetchError> = None;

        for (wave_no, wave) in order.chunks(self.race_width).enumerate() {
            if wave_no > 0 {
                tokio::time::sleep(self.wave_delay).await;
            }

            let mut set = JoinSet::new();
            for relay in wave {
                let transport = Arc::clone(&self.transport);
                let parser = self.parser.clone();
                let url = relay.url_for(&source.url);
                let label = relay.label();
                let name = source.name.clone();
                let timeout = self.request_timeout;
                attempts += 1;
                set.spawn(async move {
                    let res = fetch_via_relay(transport.as_ref(), &url, timeout, &parser, &name).await;
                    (label, res)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((relay, Ok(records))) => {
                        tracing::debug!(
                            target: "fetch",
                            source = %source.name,
                            relay = %relay,
                            attempts,
                            "relay won"
                        );
                        // dropping the set aborts the rest of the wave
                        return Ok(records);
                    }
                    Ok((relay, Err(e))) => {
                        tracing::debug!(
                            target: "fetch",
                            source = %source.name,
                            relay = %relay,
                            error = %e,
                            "relay attempt failed"
                        );
                        last = Some(e);
                    }
                    Err(join_err) => {
                        last = Some(FetchError::Network(join_err.to_string()));
                    }
                }
            }
        }

        // a single validation/parse failure is more telling than the summary
        match last {
            Some(e) if attempts == 1 => Err(e),
            other => Err(FetchError::AllRelaysFailed {
                attempts,
                last: other.map(|e| e.to_string()).unwrap_or_default(),
            }),
        }
    }
}

async fn fetch_via_relay(
    transport: &dyn RelayTransport,
    url: &str,
    timeout: Duration,
    parser: &FeedParser,
    source_name: &str,
) -> Result<Vec<ContentRecord>, FetchError> {
    let raw = tokio::time::timeout(timeout, transport.get_text(url, timeout))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

    validate_feed_shape(&raw)?;
    let clean = sanitize_feed_text(&raw);
    let records: Vec<ContentRecord> = parser
        .parse(&clean, source_name, Utc::now())?
        .into_iter()
        .filter(|r| !r.link.trim().is_empty())
        .collect();

    if records.is_empty() {
        return Err(FetchError::Validation("no items with a link".to_string()));
    }
    Ok(records)
}
