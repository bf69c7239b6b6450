// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One normalized feed item. Built once by the parser, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: String,
    pub title: String,
    pub link: String,
    pub published_at: DateTime<Utc>, // UTC, fetch time when the feed date is unusable
    pub body: String,                // tag-stripped, capped snippet
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub source_name: String,
}

/// Static source configuration. Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl SourceDescriptor {
    pub fn new(name: &str, url: &str, category: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            category: category.map(str::to_string),
        }
    }

    /// Case-insensitive category match; sources without a category never match.
    pub fn in_category(&self, category: &str) -> bool {
        self.category
            .as_deref()
            .is_some_and(|c| c.trim().eq_ignore_ascii_case(category.trim()))
    }
}

/// Stable record id.
///
/// A native guid wins (scoped by source so two feeds reusing the same guid
/// scheme stay distinct); otherwise the id is derived from source + link + title.
pub fn record_id(source_name: &str, native_id: Option<&str>, link: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_name.as_bytes());
    hasher.update([0u8]);
    match native_id.map(str::trim).filter(|g| !g.is_empty()) {
        Some(guid) => {
            hasher.update(b"guid:");
            hasher.update(guid.as_bytes());
        }
        None => {
            hasher.update(link.as_bytes());
            hasher.update([0u8]);
            hasher.update(title.as_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(24);
    for b in digest.iter().take(12) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
