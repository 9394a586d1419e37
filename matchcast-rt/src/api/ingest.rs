//! Producer ingest endpoint
//!
//! POST /api/topics/:topic/updates

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use matchcast_common::Topic;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::ingest::IngestOutcome;
use crate::AppState;

/// POST /api/topics/:topic/updates
///
/// Body is the update payload (a JSON object). Returns 201 when the update
/// created the record, 200 when it modified an existing one.
pub async fn post_update(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<IngestOutcome>)> {
    let topic = Topic::parse(&topic)?;
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let outcome = state.ingestor.ingest(&topic, payload).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(outcome)))
}

/// Build ingest routes
pub fn ingest_routes() -> Router<AppState> {
    Router::new().route("/api/topics/:topic/updates", post(post_update))
}
