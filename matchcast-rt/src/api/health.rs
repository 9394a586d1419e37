//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::scheduler::SchedulerStatus;
use crate::scorer::ScorerStats;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status ("ok")
    pub status: String,
    /// Module name ("matchcast-rt")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Topics with at least one subscriber
    pub topics: usize,
    /// Connections with at least one subscription
    pub connections: usize,
    pub scorer: ScorerStats,
    /// Null when maintenance is disabled
    pub maintenance: Option<SchedulerStatus>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        module: "matchcast-rt".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        topics: state.registry.topic_count(),
        connections: state.registry.connection_count(),
        scorer: state.scorer.stats(),
        maintenance: state.scheduler.as_ref().map(|s| s.status()),
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
