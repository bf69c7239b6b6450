// src/ingest/mod.rs
pub mod fetcher;
pub mod parser;
pub mod relay;
pub mod sanitize;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

/// One-time metrics registration (so series show up once a recorder is installed).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "feeds_fetch_success_total",
            "Source fetches that produced at least one record."
        );
        describe_counter!(
            "feeds_fetch_failure_total",
            "Source fetches that failed (network, timeout, validation, parse)."
        );
        describe_histogram!("feeds_fetch_ms", "Wall-clock time of one source fetch.");
        describe_counter!(
            "feeds_records_parsed_total",
            "Records produced by the feed parser."
        );
        describe_counter!(
            "feeds_cache_write_dropped_total",
            "Cache writes dropped after the prune-and-retry attempt."
        );
        describe_counter!(
            "feeds_sources_skipped_total",
            "Sources vetoed by the skip rule in an aggregation run."
        );
        describe_gauge!(
            "feeds_aggregate_last_run_ts",
            "Unix ts when an aggregation run last finished."
        );
    });
}

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").expect("tag regex"));
static RE_SCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("script regex")
});
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize display text: decode entities, strip markup, fold typographic
/// quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // Entities first: escaped markup (&lt;p&gt;) becomes real tags and gets stripped below.
    let decoded = html_escape::decode_html_entities(s);
    let no_scripts = RE_SCRIPT.replace_all(&decoded, " ");
    let no_tags = RE_TAGS.replace_all(&no_scripts, " ");
    // Double-escaped feeds leave entities behind after one pass.
    let mut out = html_escape::decode_html_entities(&no_tags).to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    RE_WS.replace_all(&out, " ").trim().to_string()
}

/// Cap to `max` chars, appending an ellipsis when something was cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    // avoid cutting mid-word when there is a nearby boundary
    if let Some(idx) = out.rfind(' ') {
        if out.len() - idx < 16 {
            out.truncate(idx);
        }
    }
    let trimmed = out.trim_end();
    format!("{trimmed}…")
}
