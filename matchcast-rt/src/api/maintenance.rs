//! Manual retraining trigger and scheduler status

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::scheduler::{FireOutcome, MaintenanceScheduler, SchedulerStatus};
use crate::AppState;

fn scheduler(state: &AppState) -> ApiResult<&Arc<MaintenanceScheduler>> {
    state
        .scheduler
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Maintenance disabled".to_string()))
}

/// POST /api/maintenance/run response
#[derive(Debug, Serialize)]
pub struct RunMaintenanceResponse {
    pub outcome: FireOutcome,
    pub requested_at: DateTime<Utc>,
}

/// POST /api/maintenance/run
///
/// Starts model retraining now. Returns 202 Accepted, 409 Conflict when a
/// run is already active, or 404 when maintenance is disabled.
pub async fn run_maintenance(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<RunMaintenanceResponse>)> {
    let scheduler = scheduler(&state)?;
    info!("Manual model retraining requested");

    match scheduler.fire() {
        FireOutcome::Started => Ok((
            StatusCode::ACCEPTED,
            Json(RunMaintenanceResponse {
                outcome: FireOutcome::Started,
                requested_at: matchcast_common::time::now(),
            }),
        )),
        FireOutcome::Skipped => Err(ApiError::Conflict(
            "Model retraining already running".to_string(),
        )),
    }
}

/// GET /api/maintenance
pub async fn maintenance_status(State(state): State<AppState>) -> ApiResult<Json<SchedulerStatus>> {
    Ok(Json(scheduler(&state)?.status()))
}

/// Build maintenance routes
pub fn maintenance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/maintenance", get(maintenance_status))
        .route("/api/maintenance/run", post(run_maintenance))
}
