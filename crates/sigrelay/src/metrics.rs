use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Returns 200 while ready, 503 once the router has stopped.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Registered peer gauges.
pub mod gauges {
    use sigrelay_common::Role;

    /// Increment the active peers gauge for `role`.
    pub fn inc_peers_active(role: Role) {
        metrics::gauge!("sigrelay_peers_active", "role" => role.as_str()).increment(1.0);
    }

    /// Decrement the active peers gauge for `role`.
    pub fn dec_peers_active(role: Role) {
        metrics::gauge!("sigrelay_peers_active", "role" => role.as_str()).decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Increment the relayed-envelopes counter.
    pub fn envelopes_relayed_total() {
        metrics::counter!("sigrelay_envelopes_relayed_total").increment(1);
    }

    /// Increment the dropped-envelopes counter with the given reason label.
    pub fn envelopes_dropped_total(reason: &'static str) {
        metrics::counter!("sigrelay_envelopes_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the evicted-peers counter.
    pub fn peers_evicted_total() {
        metrics::counter!("sigrelay_peers_evicted_total").increment(1);
    }

    /// Record a connection refused before upgrade.
    pub fn connections_rejected_total(reason: &'static str) {
        metrics::counter!("sigrelay_connections_rejected_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long the router spent on one dispatch, in seconds.
    pub fn dispatch_latency_seconds(value: f64) {
        metrics::histogram!("sigrelay_dispatch_latency_seconds").record(value);
    }
}
