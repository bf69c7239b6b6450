// src/merge.rs
//! Cross-source merge: dedup + recency sort.
//!
//! Two records are the same story when their normalized titles match and
//! they come from the same source or point at the same canonical link. A
//! repeated record id is always a duplicate. First seen wins, and the
//! accumulated set only ever grows, so successive snapshots built with
//! [`merge_into`] never lose a record.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::ingest::types::ContentRecord;

static RE_NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("non-word regex"));

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "yclid", "msclkid", "mc_cid", "mc_eid", "igshid", "_hsenc", "_hsmi",
    "mkt_tok", "ocid", "cmpid", "ref", "ref_src", "smid", "cmp",
];

/// Lowercase, punctuation folded to single spaces.
pub fn normalize_title(title: &str) -> String {
    RE_NON_WORD
        .replace_all(&title.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Comparison form of a link: no scheme, no `www.`, no fragment, no tracking
/// parameters, no trailing slash. Unparsable links are only trimmed and
/// lowercased.
pub fn canonical_link(link: &str) -> String {
    let trimmed = link.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    let path = url.path().trim_end_matches('/');
    match url.query() {
        Some(q) => format!("{host}{path}?{q}"),
        None => format!("{host}{path}"),
    }
}

/// Title part of the dedup key. Placeholder or empty titles fall back to the
/// link so distinct untitled items of one source are not collapsed.
fn title_key(r: &ContentRecord) -> String {
    let t = normalize_title(&r.title);
    if t.is_empty() || t == "untitled" {
        format!("link:{}", canonical_link(&r.link))
    } else {
        t
    }
}

#[derive(Default)]
struct SeenKeys {
    ids: HashSet<String>,
    by_source: HashSet<(String, String)>,
    by_link: HashSet<(String, String)>,
}

impl SeenKeys {
    fn from_records(records: &[ContentRecord]) -> Self {
        let mut seen = Self::default();
        for r in records {
            seen.check_and_insert(r);
        }
        seen
    }

    /// Returns `true` when the record is new (and remembers it).
    fn check_and_insert(&mut self, r: &ContentRecord) -> bool {
        let title = title_key(r);
        let source_key = (title.clone(), r.source_name.to_lowercase());
        let link = canonical_link(&r.link);
        let link_key = (title, link.clone());

        let dup = self.ids.contains(&r.id)
            || self.by_source.contains(&source_key)
            || (!link.is_empty() && self.by_link.contains(&link_key));
        if dup {
            return false;
        }
        self.ids.insert(r.id.clone());
        self.by_source.insert(source_key);
        if !link.is_empty() {
            self.by_link.insert(link_key);
        }
        true
    }
}

/// Fold one batch into the accumulated set, then re-sort newest first
/// (stable, so ties keep arrival order). Returns how many records were added.
pub fn merge_into(acc: &mut Vec<ContentRecord>, batch: &[ContentRecord]) -> usize {
    let mut seen = SeenKeys::from_records(acc);
    let before = acc.len();
    for r in batch {
        if seen.check_and_insert(r) {
            acc.push(r.clone());
        }
    }
    acc.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    acc.len() - before
}

/// Merge batches in order (first seen wins) into one deduplicated,
/// recency-sorted list.
pub fn merge(batches: &[Vec<ContentRecord>]) -> Vec<ContentRecord> {
    let mut acc = Vec::new();
    for batch in batches {
        merge_into(&mut acc, batch);
    }
    acc
}
