//! ==============================================================================
//! api.rs - inspection api
//! ==============================================================================
//!
//! purpose:
//!     read mostly json endpoints for looking inside a running filter.
//!
//! routes:
//!     GET    /api/v1/stats                       everything below in one document
//!     GET    /api/v1/stats/{forwarders,mqtt,cache,app}
//!     GET    /api/v1/cache                       per device summary
//!     GET    /api/v1/cache/:id                   cached entries for one device
//!     DELETE /api/v1/cache/cleanup               purge stale entries now
//!     GET    /api/v1/forwarders                  flush jobs and queued messages
//!     GET    /api/v1/logs                        recent rejections and failures
//!     GET    /api/v1/data/:id                    stored messages for one device
//!
//! relationships:
//!     - used by: main.rs (run_server)
//!     - reads: runtime.rs
//!
//! ==============================================================================

use crate::cache::{CacheSummary, DataEntry};
use crate::clock::Clock;
use crate::forwarder::JobInfo;
use crate::runtime::{CleanupReport, FilterRuntime};
use crate::stats::{AppStats, CacheStats, ForwarderStats, LogEntry, MqttStats, StatsSnapshot};
use crate::store::StoredMessage;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

type ApiError = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "status": "error", "message": message.into() })))
}

pub fn router(runtime: FilterRuntime) -> Router {
    Router::new()
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/stats/forwarders", get(forwarder_stats_handler))
        .route("/api/v1/stats/mqtt", get(mqtt_stats_handler))
        .route("/api/v1/stats/cache", get(cache_stats_handler))
        .route("/api/v1/stats/app", get(app_stats_handler))
        .route("/api/v1/cache", get(cache_handler))
        .route("/api/v1/cache/cleanup", delete(cache_cleanup_handler))
        .route("/api/v1/cache/:id", get(cache_entry_handler))
        .route("/api/v1/forwarders", get(forwarders_handler))
        .route("/api/v1/logs", get(logs_handler))
        .route("/api/v1/data/:id", get(data_handler))
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

pub async fn run_server(runtime: FilterRuntime, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}

// ==============================================================================
// stats
// ==============================================================================

async fn stats_handler(State(runtime): State<FilterRuntime>) -> Json<StatsSnapshot> {
    Json(runtime.snapshot().await)
}

async fn forwarder_stats_handler(State(runtime): State<FilterRuntime>) -> Json<ForwarderStats> {
    let active = runtime.forwarder().job_count().await;
    Json(runtime.stats().forwarders(active))
}

async fn mqtt_stats_handler(State(runtime): State<FilterRuntime>) -> Json<MqttStats> {
    Json(runtime.stats().mqtt())
}

async fn cache_stats_handler(State(runtime): State<FilterRuntime>) -> Json<CacheStats> {
    let devices = runtime.cache().lock().await.count();
    Json(CacheStats { devices })
}

async fn app_stats_handler(State(runtime): State<FilterRuntime>) -> Json<AppStats> {
    Json(runtime.stats().app())
}

// ==============================================================================
// cache
// ==============================================================================

async fn cache_handler(State(runtime): State<FilterRuntime>) -> Json<Vec<CacheSummary>> {
    Json(runtime.cache().lock().await.summary())
}

async fn cache_entry_handler(
    State(runtime): State<FilterRuntime>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DataEntry>>, ApiError> {
    let cache = runtime.cache().lock().await;
    match cache.get(&id) {
        Some(entries) => Ok(Json(entries.iter().cloned().collect())),
        None => Err(error(StatusCode::NOT_FOUND, format!("no cached data for {}", id))),
    }
}

async fn cache_cleanup_handler(State(runtime): State<FilterRuntime>) -> Json<CleanupReport> {
    Json(runtime.cleanup_cache().await)
}

// ==============================================================================
// forwarders and logs
// ==============================================================================

async fn forwarders_handler(State(runtime): State<FilterRuntime>) -> Json<Vec<JobInfo>> {
    Json(runtime.forwarder().jobs().await)
}

async fn logs_handler(State(runtime): State<FilterRuntime>) -> Json<Vec<LogEntry>> {
    Json(runtime.stats().events())
}

// ==============================================================================
// stored data
// ==============================================================================

#[derive(Debug, Deserialize)]
struct DataWindow {
    max_age_minutes: Option<i64>,
    min_age_minutes: Option<i64>,
}

const DEFAULT_MAX_AGE_MINUTES: i64 = 60;

async fn data_handler(
    State(runtime): State<FilterRuntime>,
    Path(id): Path<String>,
    Query(window): Query<DataWindow>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let Some(store) = runtime.store() else {
        return Err(error(StatusCode::SERVICE_UNAVAILABLE, "message store is disabled"));
    };

    let max_age = window.max_age_minutes.unwrap_or(DEFAULT_MAX_AGE_MINUTES);
    let min_age = window.min_age_minutes.unwrap_or(0);
    if min_age < 0 || max_age < min_age {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "expected 0 <= min_age_minutes <= max_age_minutes",
        ));
    }

    let now = runtime.clock().now();
    let since = now - chrono::Duration::minutes(max_age);
    let until = now - chrono::Duration::minutes(min_age);

    store
        .query(&id, since, until)
        .await
        .map(Json)
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}
