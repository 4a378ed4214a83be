//! ==============================================================================
//! replay.rs - feed stored traffic back through the filter
//! ==============================================================================
//!
//! purpose:
//!     re-runs a window of the message store through a filter runtime, with the
//!     clock pinned to each stored timestamp, so validation and throttling
//!     changes can be checked against real recorded traffic.
//!
//! relationships:
//!     - used by: bin/replay.rs
//!     - reads: store.rs (range), drives: runtime.rs (process_message)
//!
//! ==============================================================================

use crate::clock::ManualClock;
use crate::runtime::FilterRuntime;
use crate::store::MessageStore;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

const PROGRESS_EVERY: usize = 1000;
/// let flush tasks run now and then during long replays
const YIELD_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// replays every stored message with `since <= timestamp <= until`, oldest
/// first. `runtime` must have been built on `clock`.
pub async fn replay_window(
    store: &dyn MessageStore,
    runtime: &FilterRuntime,
    clock: &ManualClock,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<ReplayReport> {
    if until < since {
        bail!("replay window ends ({}) before it starts ({})", until, since);
    }

    let messages = store
        .range(since, until)
        .await
        .context("Failed to read stored messages")?;
    let total = messages.len();
    info!(total, %since, %until, "replaying stored messages");

    for (n, stored) in messages.iter().enumerate() {
        clock.set(stored.timestamp);
        runtime.process_message(&stored.topic, stored.message.as_bytes()).await;

        let done = n + 1;
        if done % PROGRESS_EVERY == 0 {
            info!("Replayed {}/{} ({}%)", done, total, done * 100 / total);
        }
        if done % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    Ok(ReplayReport {
        replayed: total,
        first: messages.first().map(|m| m.timestamp),
        last: messages.last().map(|m| m.timestamp),
    })
}
