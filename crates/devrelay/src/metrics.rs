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
    /// Create a health state that reports ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or draining.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

fn app(health_state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())))
}

/// Serve `/health`, `/ready` and `/metrics` on `addr`.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed or the
/// listener cannot be bound.
pub async fn start_health_server(addr: SocketAddr, health_state: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = app(health_state).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("health server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Returns 200 if ready, 503 while draining.
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

/// Connection count gauges.
pub mod gauges {
    use devrelay_common::Role;

    fn name(role: Role) -> &'static str {
        match role {
            Role::Device => "devrelay_devices_connected",
            Role::Controller => "devrelay_controllers_connected",
        }
    }

    /// Increment the connected gauge for `role`.
    pub fn inc_connected(role: Role) {
        metrics::gauge!(name(role)).increment(1.0);
    }

    /// Decrement the connected gauge for `role`.
    pub fn dec_connected(role: Role) {
        metrics::gauge!(name(role)).decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake outcome.
    pub fn auth_total(status: &'static str) {
        metrics::counter!("devrelay_auth_total", "status" => status).increment(1);
    }

    /// Record telemetry copies queued for controllers.
    pub fn telemetry_delivered_total(count: u64) {
        metrics::counter!("devrelay_telemetry_delivered_total").increment(count);
    }

    /// Record a command outcome.
    pub fn commands_total(result: &'static str) {
        metrics::counter!("devrelay_commands_total", "result" => result).increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("devrelay_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the undecodable-message counter.
    pub fn protocol_errors_total() {
        metrics::counter!("devrelay_protocol_errors_total").increment(1);
    }

    /// Record connections evicted by the liveness monitor.
    pub fn evictions_total(count: u64) {
        metrics::counter!("devrelay_liveness_evictions_total").increment(count);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long one inbound message took to dispatch, in seconds.
    pub fn dispatch_seconds(value: f64) {
        metrics::histogram!("devrelay_dispatch_seconds").record(value);
    }
}
