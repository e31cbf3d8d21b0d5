//! Liveness and readiness endpoints

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_cache::SyncStatus;
use seedlet_common::health::PeriodicHealth;
use seedlet_common::Error;

/// What readiness is computed from
#[derive(Clone, Debug)]
pub struct ProbeState {
    /// Garden cache sync flag
    pub sync: SyncStatus,
    /// Seed lease heartbeat health
    pub health: PeriodicHealth,
}

/// `/healthz` answers while the process runs; `/readyz` needs a synced
/// cache and a healthy heartbeat
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if !state.sync.is_synced() {
        return (StatusCode::SERVICE_UNAVAILABLE, "garden cache not synced");
    }
    if !state.health.check() {
        return (StatusCode::SERVICE_UNAVAILABLE, "periodic health check failed");
    }
    (StatusCode::OK, "ok")
}

/// Bind the probe listener
///
/// Done before anything else starts so an unusable address fails the agent
/// at once instead of leaving it running without probes.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("probes", format!("failed to bind {addr}: {e}")))
}

/// Serve the probes on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: ProbeState,
    cancel: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Serving health probes");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::internal_with_context("probes", format!("server error: {e}")))
}
