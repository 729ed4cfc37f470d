//! Axum server for `/healthz`, `/readyz` and `/metrics`

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::controller::metrics::REGISTRY;
use crate::error::{Error, Result};

/// State shared with the health handlers
#[derive(Clone, Default)]
pub struct ServerState {
    ready: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip readiness once the controllers are running
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn run_server(addr: SocketAddr, state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    info!("Metrics server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::metrics::{ControllerMetric, CONTROLLER_METRICS};

    #[tokio::test]
    async fn test_readyz_follows_state() {
        let state = ServerState::new();
        let (status, _) = readyz(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        let (status, _) = readyz(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_controller_counters() {
        CONTROLLER_METRICS.inc(ControllerMetric::Sync, "networkinfo");

        let (status, body) = metrics_handler().await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("netsync_controller_sync_total{res_type=\"networkinfo\"}"));
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let token = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tokio::spawn(run_server(addr, ServerState::new(), token.clone()));

        token.cancel();
        assert!(server.await.unwrap().is_ok());
    }
}
