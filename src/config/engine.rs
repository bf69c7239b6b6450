// src/config/engine.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::ingest::parser::{DEFAULT_MAX_BODY_CHARS, DEFAULT_MAX_ITEMS, DEFAULT_MAX_TITLE_CHARS};
use crate::ingest::relay::{default_relays, RelayEndpoint};

pub const ENV_ENGINE_CONFIG: &str = "FEEDS_ENGINE_CONFIG";
pub const DEFAULT_ENGINE_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_MAX_CONCURRENT: &str = "FEEDS_MAX_CONCURRENT";
pub const ENV_BATCH_SIZE: &str = "FEEDS_BATCH_SIZE";
pub const ENV_CACHE_DIR: &str = "FEEDS_CACHE_DIR";

fn default_race_width() -> usize {
    2
}
fn default_request_timeout_ms() -> u64 {
    3_000
}
fn default_source_timeout_ms() -> u64 {
    5_000
}
fn default_wave_delay_ms() -> u64 {
    250
}
fn default_max_concurrent() -> usize {
    4
}
fn default_priority_sources() -> usize {
    3
}
fn default_batch_size() -> usize {
    4
}
fn default_priority_ttl_secs() -> u64 {
    30
}
fn default_full_ttl_secs() -> u64 {
    90
}
fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}
fn default_max_title_chars() -> usize {
    DEFAULT_MAX_TITLE_CHARS
}
fn default_max_body_chars() -> usize {
    DEFAULT_MAX_BODY_CHARS
}
fn default_user_agent() -> String {
    format!("feed-relay/{}", env!("CARGO_PKG_VERSION"))
}

/// Engine tuning. Every field has a default, so a partial TOML file works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<RelayEndpoint>,
    /// Relays raced concurrently per wave.
    #[serde(default = "default_race_width")]
    pub race_width: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wall-clock cap for one source across all relay waves.
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    #[serde(default = "default_wave_delay_ms")]
    pub wave_delay_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Size of the priority tier (top-K ranked sources).
    #[serde(default = "default_priority_sources")]
    pub priority_sources: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_priority_ttl_secs")]
    pub priority_ttl_secs: u64,
    #[serde(default = "default_full_ttl_secs")]
    pub full_ttl_secs: u64,
    #[serde(default = "default_max_items")]
    pub max_items_per_source: usize,
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Directory for the file-backed store; `None` keeps everything in memory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            race_width: default_race_width(),
            request_timeout_ms: default_request_timeout_ms(),
            source_timeout_ms: default_source_timeout_ms(),
            wave_delay_ms: default_wave_delay_ms(),
            max_concurrent: default_max_concurrent(),
            priority_sources: default_priority_sources(),
            batch_size: default_batch_size(),
            priority_ttl_secs: default_priority_ttl_secs(),
            full_ttl_secs: default_full_ttl_secs(),
            max_items_per_source: default_max_items(),
            max_title_chars: default_max_title_chars(),
            max_body_chars: default_max_body_chars(),
            user_agent: default_user_agent(),
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn wave_delay(&self) -> Duration {
        Duration::from_millis(self.wave_delay_ms)
    }

    pub fn priority_ttl(&self) -> Duration {
        Duration::from_secs(self.priority_ttl_secs)
    }

    pub fn full_ttl(&self) -> Duration {
        Duration::from_secs(self.full_ttl_secs)
    }

    /// Pull out-of-range values back into their supported ranges.
    pub fn clamped(mut self) -> Self {
        self.relays.retain(|r| !r.template().is_empty());
        self.request_timeout_ms = self.request_timeout_ms.clamp(2_000, 4_000);
        self.source_timeout_ms = self
            .source_timeout_ms
            .clamp(3_000, 6_000)
            .max(self.request_timeout_ms);
        self.wave_delay_ms = self.wave_delay_ms.min(2_000);
        self.race_width = self.race_width.clamp(1, self.relays.len().max(1));
        self.max_concurrent = self.max_concurrent.clamp(1, 16);
        self.batch_size = self.batch_size.max(1);
        self.max_items_per_source = self.max_items_per_source.clamp(15, 50);
        self.max_title_chars = self.max_title_chars.max(16);
        self.max_body_chars = self.max_body_chars.max(16);
        if self.full_ttl_secs < self.priority_ttl_secs {
            self.full_ttl_secs = self.priority_ttl_secs;
        }
        self
    }

    /// Apply `FEEDS_MAX_CONCURRENT`, `FEEDS_BATCH_SIZE` and `FEEDS_CACHE_DIR`.
    /// Unparsable numbers are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = env_usize(ENV_MAX_CONCURRENT) {
            self.max_concurrent = n;
        }
        if let Some(n) = env_usize(ENV_BATCH_SIZE) {
            self.batch_size = n;
        }
        if let Ok(dir) = env::var(ENV_CACHE_DIR) {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.cache_dir = Some(PathBuf::from(dir));
            }
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, key, value = %raw, "ignoring invalid env override");
            None
        }
    }
}

/// Load engine config from an explicit TOML file (clamped, env overrides not applied).
pub fn load_engine_config_from(path: &Path) -> Result<EngineConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading engine config from {}", path.display()))?;
    let cfg: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("parsing engine config {}", path.display()))?;
    Ok(cfg.clamped())
}

/// Load engine config using env var + fallbacks:
/// 1) $FEEDS_ENGINE_CONFIG
/// 2) config/engine.toml
/// 3) built-in defaults
///
/// Env overrides are applied last, then everything is clamped.
pub fn load_engine_config_default() -> Result<EngineConfig> {
    let mut cfg = if let Ok(p) = env::var(ENV_ENGINE_CONFIG) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_ENGINE_CONFIG} points to non-existent path"));
        }
        load_engine_config_from(&pb)?
    } else {
        let default_p = PathBuf::from(DEFAULT_ENGINE_CONFIG_PATH);
        if default_p.exists() {
            load_engine_config_from(&default_p)?
        } else {
            EngineConfig::default()
        }
    };
    cfg.apply_env_overrides();
    Ok(cfg.clamped())
}
