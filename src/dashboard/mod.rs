//! Dashboard: Axum web server for round monitoring and entry.
//!
//! Serves a small REST API over the live lottery, including a manual retry
//! for winner payouts that failed. CORS enabled for local
//! development. Entry and winner histories are fed from the lottery's
//! event stream by `spawn_recorder`.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::types::LotteryEvent;
use routes::AppState;

/// Start the dashboard web server in a background task.
pub fn spawn_dashboard(state: AppState, port: u16) -> JoinHandle<Result<()>> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "Dashboard server starting on http://localhost:{port}");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind dashboard port {port}"))?;

        axum::serve(listener, app).await.context("Dashboard server error")
    })
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/upkeep", get(routes::get_upkeep))
        .route("/api/players", get(routes::get_players))
        .route("/api/winners", get(routes::get_winners))
        .route("/api/entries", get(routes::get_entries))
        .route("/api/enter", post(routes::post_enter))
        .route("/api/payout/retry", post(routes::post_retry_payout))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

/// Copy lottery events into the dashboard histories until the lottery is
/// dropped.
pub fn spawn_recorder(state: AppState, mut events: broadcast::Receiver<LotteryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => state.record(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Dashboard recorder lagged behind lottery events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
