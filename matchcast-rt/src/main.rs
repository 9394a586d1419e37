//! matchcast-rt - real-time match update service
//!
//! Accepts per-topic updates from producers (HTTP or WebSocket), persists
//! them, fans them out to WebSocket subscribers and scores newly created
//! topics with an external predictor. A calendar trigger runs the external
//! model retraining job.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use matchcast_common::config::load_config;
use matchcast_common::db::{init_database, SqliteRecordStore};
use matchcast_common::time::secs_to_duration;
use matchcast_rt::scheduler::MaintenanceScheduler;
use matchcast_rt::scorer::ProcessScorer;
use matchcast_rt::AppState;

/// Command-line arguments for matchcast-rt
#[derive(Parser, Debug)]
#[command(name = "matchcast-rt")]
#[command(about = "Real-time match update fan-out with on-demand scoring")]
#[command(version)]
struct Args {
    /// Configuration file (takes priority over MATCHCAST_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides [server].port)
    #[arg(short, long, env = "MATCHCAST_PORT")]
    port: Option<u16>,

    /// SQLite database file (overrides [database].path)
    #[arg(short, long, env = "MATCHCAST_DB")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let config = loaded.config;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.logging.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting matchcast-rt v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    for warning in &loaded.warnings {
        warn!("{}", warning);
    }
    match &loaded.source {
        Some(path) => info!("Config: {}", path.display()),
        None => info!("Config: compiled defaults"),
    }

    let db_path = args.database.unwrap_or_else(|| config.database_path());
    info!("Database: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let scheduler = if config.maintenance.enabled {
        let scheduler = MaintenanceScheduler::from_config(&config.maintenance)
            .context("Invalid maintenance schedule")?;
        info!(
            "Maintenance: {} on '{}'",
            config.maintenance.command,
            scheduler.schedule().expression()
        );
        Some(scheduler)
    } else {
        warn!("Model retraining disabled by configuration");
        None
    };
    let runner = Arc::new(ProcessScorer::from_config(&config.scorer));
    info!(
        "Scorer: {} {}",
        config.scorer.command,
        config.scorer.args.join(" ")
    );

    let state = AppState::new(
        Arc::new(SqliteRecordStore::new(pool)),
        runner,
        secs_to_duration(config.scorer.timeout_secs),
        scheduler.clone(),
        config.channel.outbound_buffer,
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = scheduler.as_ref().map(|s| s.spawn(shutdown.clone()));

    let app = matchcast_rt::build_router(state);

    let ip: std::net::IpAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind_address))?;
    let addr = SocketAddr::new(ip, args.port.unwrap_or(config.server.port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("WebSocket: ws://{}/ws", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
