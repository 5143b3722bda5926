use std::sync::Arc;
use std::time::Instant;

use psgate_metrics::process::CpuProbe;
use psgate_metrics::{MetricsRegistry, Publisher};

/// Shared application state for axum handlers.
pub struct AppState {
    pub registry: Arc<MetricsRegistry>,
    pub publisher: Arc<Publisher>,
    pub cpu: CpuProbe,
    pub started: Instant,
}

impl AppState {
    pub fn new(registry: Arc<MetricsRegistry>, publisher: Arc<Publisher>) -> Self {
        Self {
            registry,
            publisher,
            cpu: CpuProbe::new(),
            started: Instant::now(),
        }
    }
}
