use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity tier assigned to a command by classification.
///
/// Declaration order is severity order: scanning happens from `Blocked`
/// down to `Safe`, and the derived `Ord` lets callers compare severity
/// directly. `Unknown` is the implicit bucket for commands no pattern
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Safe,
    Unknown,
    Risky,
    Dangerous,
    Critical,
    Blocked,
}

impl Tier {
    /// Tiers that reject execution outright.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Dangerous | Self::Critical | Self::Blocked)
    }

    /// Tiers that require caller confirmation before execution.
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, Self::Risky | Self::Unknown)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Safe => "SAFE",
            Self::Unknown => "UNKNOWN",
            Self::Risky => "RISKY",
            Self::Dangerous => "DANGEROUS",
            Self::Critical => "CRITICAL",
            Self::Blocked => "BLOCKED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SAFE" => Ok(Self::Safe),
            "UNKNOWN" => Ok(Self::Unknown),
            "RISKY" => Ok(Self::Risky),
            "DANGEROUS" => Ok(Self::Dangerous),
            "CRITICAL" => Ok(Self::Critical),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Result of classifying a single command string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAssessment {
    pub level: Tier,
    pub category: String,
    pub reason: String,
    pub blocked: bool,
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<String>,
}

impl SecurityAssessment {
    pub fn new(level: Tier, category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            level,
            category: category.into(),
            reason: reason.into(),
            blocked: level.is_blocking(),
            requires_confirmation: level.needs_confirmation(),
            matched_pattern: None,
            normalized: None,
        }
    }
}

/// Policy for what to do when output caps are hit mid-execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowStrategy {
    /// Respond immediately with partial output, detach and kill the child.
    #[default]
    Return,
    /// Stop collecting output but let the child run to completion.
    Truncate,
    /// Stop the child as soon as the cap is hit.
    Terminate,
}

impl std::str::FromStr for OverflowStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "return" => Ok(Self::Return),
            "truncate" => Ok(Self::Truncate),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown overflow strategy: {}", other)),
        }
    }
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Return => "return",
            Self::Truncate => "truncate",
            Self::Terminate => "terminate",
        };
        write!(f, "{}", s)
    }
}

/// Parameters for opportunistic timeout extension while output flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveParams {
    pub extend_window_ms: u64,
    pub extend_step_ms: u64,
    pub max_total_sec: u64,
}

impl AdaptiveParams {
    /// Hard ceiling when the caller does not supply one: min(base*3, 180s).
    pub fn default_max_total_sec(base_timeout_sec: u64) -> u64 {
        (base_timeout_sec * 3).min(180)
    }
}

/// Input to the execution supervisor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command_text: String,
    pub cwd: Option<PathBuf>,
    pub timeout_sec: u64,
    pub adaptive: Option<AdaptiveParams>,
    pub overflow_strategy: OverflowStrategy,
}

/// Why an execution ended. Assigned exactly once per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Timeout,
    OutputOverflow,
    Killed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::OutputOverflow => "output_overflow",
            Self::Killed => "killed",
        };
        write!(f, "{}", s)
    }
}

/// Best-effort resource sample of the child process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub cpu_seconds: f64,
    pub working_set_mb: f64,
}

/// Full result of a supervised execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout_chunks: Vec<String>,
    pub stderr_chunks: Vec<String>,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub configured_timeout_ms: u64,
    pub effective_timeout_ms: u64,
    pub adaptive_extensions: u32,
    pub adaptive_extended: bool,
    pub adaptive_max_total_ms: u64,
    pub timed_out: bool,
    pub overflow: bool,
    pub overflow_strategy: OverflowStrategy,
    pub truncated: bool,
    pub termination_reason: TerminationReason,
    pub internal_self_destruct: bool,
    pub watchdog_triggered: bool,
    pub kill_escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_sample: Option<ProcessSample>,
}

impl ExecutionOutcome {
    pub fn stdout(&self) -> String {
        self.stdout_chunks.concat()
    }

    pub fn stderr(&self) -> String {
        self.stderr_chunks.concat()
    }
}

/// Decision recorded on an attempt event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Executed,
    Blocked,
    ConfirmationRequired,
    RateLimited,
    PolicyError,
}

/// Event kind published by the audit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Attempt,
    Completion,
    Audit,
}

/// Compact execution summary carried on completion events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeSummary {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub termination_reason: TerminationReason,
    pub total_bytes: u64,
    pub timed_out: bool,
    pub overflow: bool,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_sample: Option<ProcessSample>,
}

impl From<&ExecutionOutcome> for OutcomeSummary {
    fn from(o: &ExecutionOutcome) -> Self {
        Self {
            success: o.success,
            exit_code: o.exit_code,
            termination_reason: o.termination_reason,
            total_bytes: o.total_bytes,
            timed_out: o.timed_out,
            overflow: o.overflow,
            truncated: o.truncated,
            process_sample: o.process_sample,
        }
    }
}

/// Fixed-shape record published for every command attempt and completion.
///
/// `seq` is assigned by the publisher and is monotonic across all events,
/// letting consumers re-sort cross-command interleavings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEvent {
    pub seq: u64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub tool: String,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<SecurityAssessment>,
    pub decision: Decision,
    pub duration_ms: u64,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
