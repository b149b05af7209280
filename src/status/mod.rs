//! HTTP status endpoint for a running daemon.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::DaemonConfig;
use crate::scheduler::{InFlight, QueueSnapshot, QueueStats};

/// Counters updated by the daemon loops.
#[derive(Debug, Default)]
pub struct ArchiverStats {
    pub claims_won: AtomicU64,
    pub claims_lost: AtomicU64,
    pub archived: AtomicU64,
    pub failed: AtomicU64,
    pub takeovers: AtomicU64,
    pub cleanups: AtomicU64,
}

impl ArchiverStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            claims_won: self.claims_won.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            takeovers: self.takeovers.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub claims_won: u64,
    pub claims_lost: u64,
    pub archived: u64,
    pub failed: u64,
    pub takeovers: u64,
    pub cleanups: u64,
}

#[derive(Clone)]
pub struct StatusState {
    pub config: Arc<DaemonConfig>,
    pub stats: Arc<ArchiverStats>,
    pub queue: Arc<QueueStats>,
    pub in_flight: InFlight,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    identity: String,
    job_owner: Option<String>,
    poll_interval: u64,
    takeover_time: u64,
    linger_time: u64,
    queue_limit: usize,
    in_flight: usize,
    stats: StatsSnapshot,
    queue: QueueSnapshot,
}

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the status endpoint until `shutdown` fires.
pub async fn run_status_server(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let config = &state.config;
    Json(StatusResponse {
        identity: config.identity.clone(),
        job_owner: config.job_owner.clone(),
        poll_interval: config.poll_interval_ms,
        takeover_time: config.takeover_time_ms,
        linger_time: config.linger_time_ms,
        queue_limit: config.queue_limit,
        in_flight: state.in_flight.len(),
        stats: state.stats.snapshot(),
        queue: state.queue.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_snapshot_reads_counters() {
        let stats = ArchiverStats::default();
        ArchiverStats::add(&stats.archived, 2);
        ArchiverStats::add(&stats.claims_lost, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.archived, 2);
        assert_eq!(snap.claims_lost, 1);
        assert_eq!(snap.failed, 0);
    }
}
