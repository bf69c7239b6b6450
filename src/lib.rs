// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod rate_limit;
pub mod source_stats;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::aggregator::{
    AggregateOutcome, ChannelSink, NoopSink, Phase, ProgressSink, ProgressiveAggregator, RunStatus,
    Snapshot,
};
pub use crate::cache::{CacheEntry, CacheManager, CacheTier};
pub use crate::config::EngineConfig;
pub use crate::error::{ErrorKind, FetchError, ParseError};
pub use crate::ingest::fetcher::ProxyFetcher;
pub use crate::ingest::parser::FeedParser;
pub use crate::ingest::relay::{HttpTransport, RelayEndpoint, RelayTransport};
pub use crate::ingest::types::{ContentRecord, SourceDescriptor};
pub use crate::rate_limit::RateLimiter;
pub use crate::source_stats::{SourceHealth, SourceManager, SourceStats};
pub use crate::store::{FileStore, KeyValueStore, MemoryStore};
