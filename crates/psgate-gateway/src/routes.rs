use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::state::AppState;

// GET /api/metrics
pub async fn api_metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    Json(serde_json::to_value(&snapshot).unwrap_or_default())
}

#[derive(Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub since: u64,
    #[serde(default = "default_replay_limit")]
    pub limit: usize,
}

fn default_replay_limit() -> usize {
    50
}

// GET /api/events/replay?since=<seq>&limit=<n> — polling fallback for
// consumers that cannot hold an SSE stream open.
pub async fn replay(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ReplayQuery>,
) -> Json<serde_json::Value> {
    let events = state.publisher.replay(q.since, q.limit.min(200));
    Json(serde_json::json!({ "events": events }))
}

// GET /metrics — text exposition for scraping
pub async fn prometheus(State(state): State<Arc<AppState>>) -> String {
    let snap = state.registry.snapshot();
    let mut out = String::with_capacity(1024);

    let mut counter = |name: &str, help: &str, value: f64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
        ));
    };
    counter("commands_total", "Commands seen by the gateway", snap.total_commands as f64);
    counter("commands_blocked_total", "Commands rejected as blocked", snap.blocked as f64);
    counter("commands_timeout_total", "Executions that timed out", snap.timeouts as f64);
    counter("commands_truncated_total", "Executions with truncated output", snap.truncated as f64);
    counter(
        "commands_confirmation_required_total",
        "Commands rejected pending confirmation",
        snap.confirmation_required as f64,
    );

    let mut gauge = |out: &mut String, name: &str, help: &str, value: f64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
        ));
    };
    gauge(&mut out, "command_duration_avg_ms", "Mean execution duration", snap.average_duration_ms);
    gauge(&mut out, "command_duration_p95_ms", "p95 execution duration", snap.p95_duration_ms);
    gauge(
        &mut out,
        "event_loop_lag_p95_ms",
        "p95 scheduler lag from the probe task",
        snap.event_loop_lag_p95_ms,
    );
    if let Some(cpu) = state.cpu.sample() {
        gauge(&mut out, "process_cpu_percent", "Gateway process CPU", cpu);
    }
    if let Some(ws) = psgate_metrics::process::self_working_set_mb() {
        gauge(&mut out, "process_working_set_mb", "Gateway resident set", ws);
    }

    out
}

// GET /events — server-sent events; id is the publisher seq so clients
// can resume via the replay endpoint.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.publisher.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .id(event.seq.to_string())
                        .event("execution")
                        .json_data(&event);
                    match sse {
                        Ok(e) => return Some((Ok::<_, Infallible>(e), rx)),
                        Err(_) => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// GET /healthz
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// GET /readyz
pub async fn readyz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "uptimeSec": state.started.elapsed().as_secs(),
    }))
}

// GET /version
pub async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "psgate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use psgate_core::event::EventBus;
    use psgate_metrics::{MetricsRegistry, Publisher, PublisherOptions};

    fn state(dir: &std::path::Path) -> Arc<AppState> {
        let registry = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::default());
        let publisher = Publisher::spawn(
            registry.clone(),
            bus,
            None,
            None,
            PublisherOptions {
                disable_attempt_publish: false,
                structured_audit: false,
                data_dir: dir.to_path_buf(),
            },
        );
        Arc::new(AppState::new(registry, publisher))
    }

    #[tokio::test]
    async fn prometheus_exposition_renders_names() {
        let dir = tempfile::tempdir().unwrap();
        let text = prometheus(State(state(dir.path()))).await;
        assert!(text.contains("commands_total 0"));
        assert!(text.contains("command_duration_p95_ms"));
        assert!(text.contains("event_loop_lag_p95_ms"));
        assert!(text.contains("# TYPE commands_total counter"));
    }

    #[tokio::test]
    async fn replay_endpoint_returns_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let q = Query(ReplayQuery { since: 0, limit: 10 });
        let Json(body) = replay(State(state(dir.path())), q).await;
        assert_eq!(body["events"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let dir = tempfile::tempdir().unwrap();
        let Json(h) = healthz().await;
        assert_eq!(h["status"], serde_json::json!("ok"));
        let Json(r) = readyz(State(state(dir.path()))).await;
        assert_eq!(r["status"], serde_json::json!("ready"));
        let Json(v) = version().await;
        assert_eq!(v["name"], serde_json::json!("psgate"));
    }
}
