// src/config/sources.rs
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::SourceDescriptor;

pub const ENV_SOURCES_PATH: &str = "FEEDS_SOURCES_PATH";

/// Load the source list from an explicit path. Supports TOML (`[[sources]]`)
/// or a JSON array of `{name, url, category?}` objects.
pub fn load_sources_from(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_sources(&content, ext.as_str())
        .with_context(|| format!("parsing sources from {}", path.display()))
}

/// Load sources using env var + fallbacks:
/// 1) $FEEDS_SOURCES_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
/// 4) built-in seed list
pub fn load_sources_default() -> Result<Vec<SourceDescriptor>> {
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_sources_from(&pb);
        } else {
            return Err(anyhow!("{ENV_SOURCES_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_sources_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_sources_from(&json_p);
    }
    Ok(default_seed())
}

fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<SourceDescriptor>> {
    let try_toml = hint_ext == "toml" || s.contains("[[sources]]");
    if try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    if !try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    Err(anyhow!("unsupported sources format"))
}

fn parse_toml(s: &str) -> Result<Vec<SourceDescriptor>> {
    #[derive(serde::Deserialize)]
    struct TomlSources {
        sources: Vec<SourceDescriptor>,
    }
    let v: TomlSources = toml::from_str(s)?;
    Ok(clean_list(v.sources))
}

fn parse_json(s: &str) -> Result<Vec<SourceDescriptor>> {
    let v: Vec<SourceDescriptor> = serde_json::from_str(s)?;
    Ok(clean_list(v))
}

/// Trim, drop incomplete entries and repeated names. Order is kept: it is the
/// ranking tie-breaker.
fn clean_list(items: Vec<SourceDescriptor>) -> Vec<SourceDescriptor> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        let name = it.name.trim();
        let url = it.url.trim();
        if name.is_empty() || url.is_empty() {
            continue;
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            continue;
        }
        let category = it
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        out.push(SourceDescriptor::new(name, url, category));
    }
    out
}

/// Built-in seed with a few general, tech and science feeds.
pub fn default_seed() -> Vec<SourceDescriptor> {
    [
        ("BBC News", "https://feeds.bbci.co.uk/news/rss.xml", "world"),
        ("NPR", "https://feeds.npr.org/1001/rss.xml", "world"),
        ("The Guardian", "https://www.theguardian.com/world/rss", "world"),
        ("Al Jazeera", "https://www.aljazeera.com/xml/rss/all.xml", "world"),
        ("Ars Technica", "https://feeds.arstechnica.com/arstechnica/index", "tech"),
        ("The Verge", "https://www.theverge.com/rss/index.xml", "tech"),
        ("Hacker News", "https://hnrss.org/frontpage", "tech"),
        ("TechCrunch", "https://techcrunch.com/feed/", "tech"),
        ("NASA", "https://www.nasa.gov/news-release/feed/", "science"),
        ("ScienceDaily", "https://www.sciencedaily.com/rss/all.xml", "science"),
    ]
    .into_iter()
    .map(|(name, url, cat)| SourceDescriptor::new(name, url, Some(cat)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn toml_and_json_are_cleaned_in_order() {
        let toml = r#"
[[sources]]
name = " Beta "
url = "https://b/rss"
category = "tech"

[[sources]]
name = "Alpha"
url = "https://a/rss"

[[sources]]
name = "beta"
url = "https://dup/rss"

[[sources]]
name = "NoUrl"
url = "  "
"#;
        let out = parse_toml(toml).unwrap();
        let names: Vec<&str> = out.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Alpha"]);
        assert_eq!(out[0].category.as_deref(), Some("tech"));
        assert_eq!(out[1].category, None);

        let json = r#"[{"name":"X","url":"https://x","category":" "},{"name":"","url":"https://y"}]"#;
        let out = parse_json(json).unwrap();
        assert_eq!(out, vec![SourceDescriptor::new("X", "https://x", None)]);
    }

    #[test]
    fn unknown_format_is_an_error() {
        assert!(parse_sources("just words", "txt").is_err());
    }

    #[test]
    fn seed_is_unique_and_categorized() {
        let seed = default_seed();
        assert_eq!(clean_list(seed.clone()), seed);
        assert!(seed.iter().all(|s| s.category.is_some()));
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_SOURCES_PATH);

        // no files → seed
        assert_eq!(load_sources_default().unwrap(), default_seed());

        fs::create_dir_all("config").unwrap();
        fs::write("config/sources.json", r#"[{"name":"J","url":"https://j"}]"#).unwrap();
        assert_eq!(load_sources_default().unwrap()[0].name, "J");

        fs::write(
            "config/sources.toml",
            "[[sources]]\nname = \"T\"\nurl = \"https://t\"\n",
        )
        .unwrap();
        assert_eq!(load_sources_default().unwrap()[0].name, "T");

        let p = tmp.path().join("mine.json");
        fs::write(&p, r#"[{"name":"E","url":"https://e"}]"#).unwrap();
        env::set_var(ENV_SOURCES_PATH, p.display().to_string());
        assert_eq!(load_sources_default().unwrap()[0].name, "E");
        env::remove_var(ENV_SOURCES_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
