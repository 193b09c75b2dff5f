use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quantgate_api::config::{EngineConfig, ServerConfig};
use quantgate_api::router::build_app_router;
use quantgate_api::state::AppState;
use quantgate_api::workloads::{simulated_registry, WorkloadConfig};
use quantgate_worker::{Controller, InMemoryJobStore, ProcProbe};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "quantgate_api=debug,quantgate_worker=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let engine = EngineConfig::from_env();
    tracing::info!(
        max_concurrent_jobs = engine.settings.limits.max_concurrent_jobs,
        max_queue_depth = engine.settings.limits.max_queue_depth,
        min_workers = engine.settings.pool.min_workers,
        max_workers = engine.settings.pool.max_workers,
        fairness = engine.settings.fairness.is_some(),
        "Loaded engine configuration",
    );

    // --- Engine ---
    let controller = Arc::new(
        Controller::new(
            engine.settings,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(ProcProbe::new()),
            simulated_registry(WorkloadConfig::default()),
        )
        .expect("Invalid engine configuration"),
    );
    controller.start().await;

    // --- App state ---
    let state = AppState {
        controller: Arc::clone(&controller),
        config: Arc::new(config.clone()),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping engine");

    let timeout = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, controller.stop()).await.is_err() {
        tracing::warn!(timeout_secs = config.shutdown_timeout_secs, "Engine stop timed out");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
