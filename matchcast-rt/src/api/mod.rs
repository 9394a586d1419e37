//! HTTP and WebSocket surface for matchcast-rt

pub mod health;
pub mod ingest;
pub mod maintenance;
pub mod ws;

pub use health::health_routes;
pub use ingest::ingest_routes;
pub use maintenance::maintenance_routes;
pub use ws::ws_routes;
