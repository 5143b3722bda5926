use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use psgate_core::types::{CommandEvent, Decision, EventKind, ProcessSample, Tier};

/// In-memory metrics registry. One mutex, short critical sections:
/// counter bumps and duration pushes only; snapshots copy under lock
/// and compute aggregates outside it.
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    total_commands: u64,
    per_tier: BTreeMap<Tier, u64>,
    blocked: u64,
    truncated: u64,
    timeouts: u64,
    confirmation_required: u64,
    rate_limited: u64,

    attempt_commands: u64,
    attempt_confirmation_required: u64,
    execution_commands: u64,
    confirmed_executions: u64,

    // Non-zero durations of real executions only.
    durations_ms: Vec<u64>,
    cpu_seconds: Vec<f64>,
    working_set_mb: Vec<f64>,
    lag_ms: Vec<u64>,
}

/// Serialized snapshot for `/api/metrics` and `server-stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_commands: u64,
    pub per_tier: BTreeMap<String, u64>,
    pub blocked: u64,
    pub truncated: u64,
    pub timeouts: u64,
    pub confirmation_required: u64,
    pub rate_limited: u64,
    pub attempt_commands: u64,
    pub attempt_confirmation_required: u64,
    pub execution_commands: u64,
    pub confirmed_executions: u64,
    pub confirmation_conversion: f64,
    pub average_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub event_loop_lag_p95_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessAggregates>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAggregates {
    pub samples: u64,
    pub cpu_seconds_avg: f64,
    pub working_set_mb_avg: f64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record an attempt event (duration 0, emitted before any wait).
    pub fn record_attempt(&self, event: &CommandEvent) {
        debug_assert_eq!(event.kind, EventKind::Attempt);
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_commands += 1;
        inner.attempt_commands += 1;
        if let Some(a) = &event.assessment {
            *inner.per_tier.entry(a.level).or_insert(0) += 1;
        }
        match event.decision {
            Decision::Blocked => inner.blocked += 1,
            Decision::ConfirmationRequired => {
                inner.confirmation_required += 1;
                inner.attempt_confirmation_required += 1;
            }
            Decision::RateLimited => inner.rate_limited += 1,
            Decision::Executed | Decision::PolicyError => {}
        }
    }

    /// Record a completion event carrying a full outcome.
    pub fn record_completion(&self, event: &CommandEvent) {
        debug_assert_eq!(event.kind, EventKind::Completion);
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.execution_commands += 1;
        if event.confirmed {
            inner.confirmed_executions += 1;
        }
        // Zero-duration entries are attempts, not executions; keep the
        // latency vector clean of them.
        if event.duration_ms > 0 {
            inner.durations_ms.push(event.duration_ms);
        }
        if let Some(outcome) = &event.outcome {
            if outcome.truncated {
                inner.truncated += 1;
            }
            if outcome.timed_out {
                inner.timeouts += 1;
            }
            if let Some(ProcessSample { cpu_seconds, working_set_mb }) = outcome.process_sample {
                inner.cpu_seconds.push(cpu_seconds);
                inner.working_set_mb.push(working_set_mb);
            }
        }
    }

    /// Feed one event-loop lag probe sample.
    pub fn record_lag(&self, lag_ms: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.lag_ms.push(lag_ms);
        // The probe ticks forever; cap the vector so it cannot grow
        // without bound.
        if inner.lag_ms.len() > 4_096 {
            inner.lag_ms.drain(..2_048);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (inner_copy, durations, lag) = {
            let inner = self.inner.lock().expect("metrics lock poisoned");
            (
                InnerCopy::from(&*inner),
                inner.durations_ms.clone(),
                inner.lag_ms.clone(),
            )
        };

        let average = mean(&durations);
        let mut p95 = percentile_ceil(&durations, 95);
        // Display invariant: p95 never reads below the mean.
        if p95 < average {
            p95 = average;
        }

        let process = if inner_copy.cpu_seconds.is_empty() {
            None
        } else {
            Some(ProcessAggregates {
                samples: inner_copy.cpu_seconds.len() as u64,
                cpu_seconds_avg: mean_f64(&inner_copy.cpu_seconds),
                working_set_mb_avg: mean_f64(&inner_copy.working_set_mb),
            })
        };

        MetricsSnapshot {
            total_commands: inner_copy.total_commands,
            per_tier: inner_copy
                .per_tier
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            blocked: inner_copy.blocked,
            truncated: inner_copy.truncated,
            timeouts: inner_copy.timeouts,
            confirmation_required: inner_copy.confirmation_required,
            rate_limited: inner_copy.rate_limited,
            attempt_commands: inner_copy.attempt_commands,
            attempt_confirmation_required: inner_copy.attempt_confirmation_required,
            execution_commands: inner_copy.execution_commands,
            confirmed_executions: inner_copy.confirmed_executions,
            confirmation_conversion: inner_copy.confirmed_executions as f64
                / (inner_copy.attempt_confirmation_required.max(1)) as f64,
            average_duration_ms: average,
            p95_duration_ms: p95,
            event_loop_lag_p95_ms: percentile_ceil(&lag, 95),
            process,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct InnerCopy {
    total_commands: u64,
    per_tier: BTreeMap<Tier, u64>,
    blocked: u64,
    truncated: u64,
    timeouts: u64,
    confirmation_required: u64,
    rate_limited: u64,
    attempt_commands: u64,
    attempt_confirmation_required: u64,
    execution_commands: u64,
    confirmed_executions: u64,
    cpu_seconds: Vec<f64>,
    working_set_mb: Vec<f64>,
}

impl From<&Inner> for InnerCopy {
    fn from(inner: &Inner) -> Self {
        Self {
            total_commands: inner.total_commands,
            per_tier: inner.per_tier.clone(),
            blocked: inner.blocked,
            truncated: inner.truncated,
            timeouts: inner.timeouts,
            confirmation_required: inner.confirmation_required,
            rate_limited: inner.rate_limited,
            attempt_commands: inner.attempt_commands,
            attempt_confirmation_required: inner.attempt_confirmation_required,
            execution_commands: inner.execution_commands,
            confirmed_executions: inner.confirmed_executions,
            cpu_seconds: inner.cpu_seconds.clone(),
            working_set_mb: inner.working_set_mb.clone(),
        }
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Ceil-index percentile over a copy of the samples.
fn percentile_ceil(values: &[u64], pct: u64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((pct as f64 / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[idx.clamp(1, sorted.len()) - 1] as f64
}
