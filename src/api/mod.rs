//! Control API: Axum server exposing the session engine over HTTP.
//!
//! Operators start, stop and inspect their sessions and edit their
//! configuration. An optional allowlist restricts which operator ids are
//! served. CORS is enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{ApiState, AppState};

/// Bind the control API and serve it in a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control API on port {port}"))?;
    info!(port, "Control API listening on http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Control API server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/operators/:id/status", get(routes::get_status))
        .route("/api/operators/:id/start", post(routes::start_session))
        .route("/api/operators/:id/stop", post(routes::stop_session))
        .route(
            "/api/operators/:id/config",
            get(routes::get_config).put(routes::put_config),
        )
        .route(
            "/api/operators/:id/config/trade-pct",
            patch(routes::patch_trade_pct),
        )
        .route(
            "/api/operators/:id/config/interval",
            patch(routes::patch_interval),
        )
        .route("/api/operators/:id/trades", get(routes::get_trades))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
