// src/server/metrics_server.rs

use crate::core::metrics::{self, gather_metrics};
use crate::core::state::GatewayState;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler(state: Arc<GatewayState>) -> impl IntoResponse {
    metrics::CREDENTIALS_LOADED.set(state.credentials.len() as f64);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Runs a small HTTP server exposing Prometheus metrics on /metrics until shutdown.
pub async fn run_metrics_server(
    state: Arc<GatewayState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let port = state.config.metrics.port;
    let app = Router::new().route("/metrics", get(move || metrics_handler(state.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind metrics server on port {port}: {e}"))?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await?;
    Ok(())
}
