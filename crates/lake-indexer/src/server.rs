//! HTTP surface: liveness, readiness and metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::indexer::{Indexer, ViewStatus};

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// True once every view has refreshed successfully.
    pub ready: bool,
    /// Per-view readiness.
    pub views: Vec<ViewStatus>,
}

/// Liveness: always 200 while the process serves requests.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness: 200 once every view is ready, 503 before.
async fn ready(State(indexer): State<Arc<Indexer>>) -> impl IntoResponse {
    let ready = indexer.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            views: indexer.readiness(),
        }),
    )
}

/// Builds the router.
pub fn router(indexer: Arc<Indexer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(crate::metrics::serve_metrics))
        .with_state(indexer)
}

/// Serves the router on `addr` until `shutdown` becomes true.
///
/// # Errors
///
/// Returns a configuration error if the address cannot be bound, or a
/// source error if the server fails.
pub async fn serve(addr: SocketAddr, indexer: Arc<Indexer>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "http server listening");

    axum::serve(listener, router(indexer))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::upstream("http", e.to_string()))?;
    tracing::info!("http server stopped");
    Ok(())
}
