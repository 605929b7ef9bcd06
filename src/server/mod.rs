//! HTTP surface.
//!
//! Tenant-facing routes for feeds and run history, the manual poll trigger,
//! and the internal operator routes. Everything user-visible comes out of
//! the run ledger; the handlers never reach into a run in progress.

pub mod auth;
mod routes;
pub mod state;

pub use auth::hash_api_key;
pub use state::{ServerConfig, ServerState};

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn make_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/runs/poll-now", post(routes::poll_now))
        .route("/api/runs", get(routes::list_runs))
        .route("/api/runs/:run_id", get(routes::get_run))
        .route("/api/feeds", get(routes::list_feeds).post(routes::add_feed))
        .route("/api/feeds/:feed_id/archive", post(routes::archive_feed))
        .route("/api/feeds/:feed_id/restore", post(routes::restore_feed))
        .route("/internal/run-sync-now", post(routes::run_sync_now))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the shutdown token fires.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let router = make_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Serving API on port {}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")
}
