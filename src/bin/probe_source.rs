//! Fetch + parse one configured source in isolation and print what came back.
//!
//! Usage: `probe_source <source name>`

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use feed_relay::config::{load_engine_config_default, load_sources_default};
use feed_relay::ProgressiveAggregator;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FEEDS_LOG").unwrap_or_else(|_| EnvFilter::new("fetch=debug,warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let name = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if name.trim().is_empty() {
        bail!("usage: probe_source <source name>");
    }

    let cfg = load_engine_config_default().context("loading engine config")?;
    let sources = load_sources_default().context("loading source list")?;
    let aggregator = ProgressiveAggregator::from_config(cfg, sources)?;

    match aggregator.probe_source_detailed(name.trim()).await {
        Ok(records) => {
            println!("{} records from {}", records.len(), name.trim());
            for r in records {
                println!("- {} ({})", r.title, r.published_at.to_rfc3339());
                println!("  {}", r.link);
                if let Some(img) = r.image_url {
                    println!("  image: {img}");
                }
            }
        }
        Err(e) => {
            println!("probe failed [{}]: {e}", e.kind().as_str());
            std::process::exit(1);
        }
    }
    Ok(())
}
