//! feed-relay: command-line runner.
//!
//! `feed-relay [category]` loads the engine config and source list, runs one
//! progressive aggregation, prints a line per snapshot and then the final list.
//! `feed-relay --health` prints the persisted per-source stats instead.
//! Logs go to stderr; filter with `FEEDS_LOG` or `RUST_LOG`, and set
//! `FEEDS_LOG_FORMAT=json` for one JSON object per line.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_relay::config::{load_engine_config_default, load_sources_default};
use feed_relay::{ContentRecord, ProgressiveAggregator};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FEEDS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("aggregate=info,sources=info,cache=info,warn"));

    let json = std::env::var("FEEDS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let category = std::env::args().nth(1);

    let cfg = load_engine_config_default().context("loading engine config")?;
    let sources = load_sources_default().context("loading source list")?;
    tracing::info!(
        sources = sources.len(),
        relays = cfg.relays.len(),
        batch_size = cfg.batch_size,
        max_concurrent = cfg.max_concurrent,
        "starting aggregation"
    );

    let aggregator = ProgressiveAggregator::from_config(cfg, sources)?;

    if category.as_deref() == Some("--health") {
        for h in aggregator.source_manager().health_report() {
            println!(
                "{:<24} score={:>6.2} rate={:.2} avg_ms={:>7.0} failures={} skip={}",
                h.source.name,
                h.score,
                h.stats.success_rate,
                h.stats.avg_response_time_ms,
                h.stats.consecutive_failures,
                h.skippable
            );
        }
        return Ok(());
    }

    let sink = |records: &[ContentRecord], done: bool| {
        eprintln!(
            "[progress] {} records{}",
            records.len(),
            if done { " (final)" } else { "" }
        );
    };

    let outcome = match category.as_deref() {
        Some(cat) => aggregator.aggregate_category(cat, &sink).await,
        None => aggregator.run(&sink).await,
    };

    let stats = Arc::clone(aggregator.source_manager());
    tokio::task::spawn_blocking(move || stats.flush())
        .await
        .context("flushing source stats")?;

    for r in &outcome.records {
        println!(
            "{}  [{}]  {}\n    {}",
            r.published_at.format("%Y-%m-%d %H:%M"),
            r.source_name,
            r.title,
            r.link
        );
    }
    eprintln!(
        "status={:?} records={} attempted={} succeeded={} failed={} skipped={}",
        outcome.status,
        outcome.records.len(),
        outcome.attempted,
        outcome.succeeded,
        outcome.failed,
        outcome.skipped
    );
    Ok(())
}
