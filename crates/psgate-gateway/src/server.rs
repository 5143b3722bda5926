use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use psgate_metrics::MetricsRegistry;

use crate::routes;
use crate::state::AppState;

/// Cadence of the event-loop lag probe.
const LAG_PROBE_MS: u64 = 500;

/// Read-only HTTP dashboard built on axum: metrics snapshot, Prometheus
/// exposition, SSE event stream, and health endpoints.
pub struct GatewayServer {
    bind: String,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(bind: impl Into<String>, state: Arc<AppState>) -> Self {
        Self {
            bind: bind.into(),
            state,
        }
    }

    /// Run the server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        spawn_lag_probe(self.state.registry.clone(), shutdown.clone());

        let app = Router::new()
            .route("/api/metrics", get(routes::api_metrics))
            .route("/api/events/replay", get(routes::replay))
            .route("/metrics", get(routes::prometheus))
            .route("/events", get(routes::events))
            .route("/healthz", get(routes::healthz))
            .route("/readyz", get(routes::readyz))
            .route("/version", get(routes::version))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&self.bind).await?;
        info!(bind = %self.bind, "Dashboard listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Dashboard shut down");
        Ok(())
    }
}

/// Measures scheduler latency by timing sleep overshoot.
fn spawn_lag_probe(registry: Arc<MetricsRegistry>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let period = Duration::from_millis(LAG_PROBE_MS);
        loop {
            let before = Instant::now();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let lag = before.elapsed().saturating_sub(period);
            registry.record_lag(lag.as_millis() as u64);
        }
    });
}
