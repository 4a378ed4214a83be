//! ==============================================================================
//! main.rs - omg-filter entry point
//! ==============================================================================
//!
//! purpose:
//!     connects to the broker, subscribes to the raw gateway stream and
//!     republishes validated, throttled readings.
//!
//! responsibilities:
//!     - load configuration (file, then environment)
//!     - install the tracing subscriber
//!     - run the mqtt event loop, feeding the filter runtime
//!     - serve the inspection api
//!     - periodic housekeeping (cache cleanup, store purge)
//!     - stop flush jobs on ctrl-c
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                     omg-filter (this file)                  │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │ mqtt events │  │ api server  │  │ housekeeping        │  │
//!     │  │ (rumqttc)   │  │ (port 3000) │  │ (cache, store)      │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │                │                    │             │
//!     │         └────────────────┼────────────────────┘             │
//!     │                          │                                  │
//!     │                    ┌─────┴─────┐                            │
//!     │                    │  runtime  │ <- runtime.rs              │
//!     │                    └─────┬─────┘                            │
//!     │       (clone-able handle to registry, cache & forwarder)    │
//!     └──────────────────────────┼──────────────────────────────────┘
//!                                │ one flush task per device
//!                                ▼
//!                         downstream broker
//!
//! ==============================================================================

use anyhow::{Context, Result};
use omg_filter::api;
use omg_filter::clock::{Clock, SystemClock};
use omg_filter::store::{JsonlStore, MessageStore};
use omg_filter::transport::MqttTransport;
use omg_filter::{FilterConfig, FilterRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  omg-filter");
    println!("  OpenMQTTGateway telemetry filter & throttle");
    println!("===========================================================");

    // step 1: load configuration
    let config = FilterConfig::load_or_default();
    config.print_summary();

    // step 2: logging. RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // step 3: collaborators
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (transport, events) = MqttTransport::connect(&config.mqtt);
    let store: Option<Arc<dyn MessageStore>> = if config.store.enabled {
        Some(Arc::new(JsonlStore::new(&config.store.path)))
    } else {
        None
    };

    // step 4: the filter itself
    let runtime = FilterRuntime::new(&config, Arc::new(transport), store.clone(), clock.clone())
        .context("invalid topic configuration")?;

    let mqtt_runtime = runtime.clone();
    tokio::spawn(events.run(move |topic, payload| {
        let runtime = mqtt_runtime.clone();
        async move { runtime.dispatch(&topic, payload).await }
    }));

    runtime.start().await.context("failed to subscribe to source topic")?;
    info!("Publishing to {}", config.topics.dst);

    // step 5: the inspection api
    if config.api.enabled {
        let api_runtime = runtime.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            info!("API listening on http://0.0.0.0:{}", port);
            if let Err(e) = api::run_server(api_runtime, port).await {
                error!("API server error: {:#}", e);
            }
        });
    }

    // step 6: housekeeping
    spawn_cache_cleanup(runtime.clone(), config.cache.cleanup_interval_secs);
    if let Some(store) = store {
        spawn_store_purge(
            store,
            clock,
            config.store.retention_days,
            config.store.purge_interval_secs,
        );
    }

    println!("\n[RUNTIME] Filtering started. Ctrl-C to stop.");
    println!("────────────────────────────────────────────────────────────");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    runtime.shutdown().await;
    Ok(())
}

fn spawn_cache_cleanup(runtime: FilterRuntime, every_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = runtime.cleanup_cache().await;
            if report.deleted > 0 {
                info!(
                    deleted = report.deleted,
                    remaining = report.final_count,
                    "cache cleanup"
                );
            }
        }
    });
}

fn spawn_store_purge(
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    retention_days: i64,
    every_secs: u64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(60)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let cutoff = clock.now() - chrono::Duration::days(retention_days);
            match store.purge_older_than(cutoff).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged stored messages older than {} days", retention_days),
                Err(e) => warn!("Store purge failed: {:#}", e),
            }
        }
    });
}
