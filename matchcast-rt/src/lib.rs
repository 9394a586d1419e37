//! matchcast-rt library interface
//!
//! Real-time update fan-out with on-demand scoring: producers push updates
//! per topic, subscribers receive them live over WebSocket, and the first
//! update for a topic launches an external scoring computation whose result
//! is pushed to the same subscribers.

pub mod api;
pub mod channel;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod scheduler;
pub mod scorer;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use matchcast_common::db::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ingest::UpdateIngestor;
use crate::registry::TopicRegistry;
use crate::scheduler::MaintenanceScheduler;
use crate::scorer::{ScorerGateway, ScorerRunner};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TopicRegistry>,
    pub ingestor: Arc<UpdateIngestor>,
    pub scorer: Arc<ScorerGateway>,
    /// None when maintenance is disabled
    pub scheduler: Option<Arc<MaintenanceScheduler>>,
    /// Outbound queue capacity per WebSocket session
    pub channel_capacity: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the registry, scorer gateway and ingestor together
    pub fn new(
        store: Arc<dyn RecordStore>,
        runner: Arc<dyn ScorerRunner>,
        scorer_timeout: Duration,
        scheduler: Option<Arc<MaintenanceScheduler>>,
        channel_capacity: usize,
    ) -> Self {
        let registry = TopicRegistry::shared();
        let scorer = ScorerGateway::new(runner, Arc::clone(&registry), scorer_timeout);
        let ingestor = Arc::new(UpdateIngestor::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&scorer),
        ));

        Self {
            registry,
            ingestor,
            scorer,
            scheduler,
            channel_capacity,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::ws_routes())
        .merge(api::ingest_routes())
        .merge(api::maintenance_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
