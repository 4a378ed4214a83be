//! ==============================================================================
//! replay - run recorded traffic through the filter offline
//! ==============================================================================
//!
//! usage:
//!
//!     replay --since 2023-12-10T08:35:45Z --until 2023-12-10T08:43:30Z
//!     replay --store data/messages.jsonl --since ... --until ... --interval-secs 5
//!
//! reads the json lines message store, replays the window with the clock
//! pinned to each message's stored time and prints the resulting statistics.
//! nothing is published to the broker and nothing is written back to the
//! store.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use omg_filter::clock::ManualClock;
use omg_filter::replay::replay_window;
use omg_filter::store::JsonlStore;
use omg_filter::transport::MemoryTransport;
use omg_filter::{FilterConfig, FilterRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Replay stored gateway traffic through the filter
#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Message store to read (defaults to store.path from the config)
    #[arg(long, env = "STORE_PATH")]
    store: Option<PathBuf>,

    /// Start of the window, RFC 3339
    #[arg(long)]
    since: DateTime<Utc>,

    /// End of the window, RFC 3339
    #[arg(long)]
    until: DateTime<Utc>,

    /// Throttle interval used while replaying
    #[arg(long, default_value = "1")]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FilterConfig::load_or_default();
    let interval_secs = args.interval_secs.max(1);
    config.throttle.default_interval_secs = interval_secs;
    config.throttle.probe_interval_secs = config.throttle.probe_interval_secs.min(interval_secs);

    let path = args.store.unwrap_or_else(|| PathBuf::from(&config.store.path));
    let store = JsonlStore::new(&path);

    let clock = Arc::new(ManualClock::new(args.since));
    let transport = Arc::new(MemoryTransport::new());
    let runtime = FilterRuntime::new(&config, transport.clone(), None, clock.clone())
        .context("invalid topic configuration")?;

    let report = replay_window(&store, &runtime, &clock, args.since, args.until)
        .await
        .with_context(|| format!("replay of {} failed", path.display()))?;

    // give every flush job one more tick before stopping
    tokio::time::sleep(Duration::from_secs(interval_secs * 2)).await;
    runtime.shutdown().await;

    let output = serde_json::json!({
        "replay": report,
        "published": transport.published().len(),
        "stats": runtime.snapshot().await,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
