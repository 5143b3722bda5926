use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use psgate_core::classify::Classifier;
use psgate_core::config::ConfigStore;
use psgate_core::error::PsgateError;
use psgate_core::gate::{self, CallerFlags, GateDecision, GateRejection};
use psgate_core::learning::LearningHandle;
use psgate_core::ratelimit::RateLimiter;
use psgate_core::types::{
    AdaptiveParams, CommandEvent, Decision, EventKind, ExecutionOutcome, ExecutionRequest,
    OutcomeSummary, SecurityAssessment,
};
use psgate_core::workdir;
use psgate_engine::Supervisor;
use psgate_metrics::{MetricsRegistry, Publisher};

use crate::args::RunPowershellArgs;
use crate::tool::ToolOutput;

/// Identity and authentication state of the calling session.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    pub client_id: String,
    pub operator_authenticated: bool,
}

impl Default for CallerInfo {
    fn default() -> Self {
        Self {
            client_id: "default".to_string(),
            operator_authenticated: false,
        }
    }
}

/// The security-enforced execution pipeline. Tools call into it; it is
/// the only component that touches the classifier, gate, supervisor,
/// and publisher together, so every command gets uniform audit.
pub struct Pipeline {
    pub config: Arc<ConfigStore>,
    pub classifier: Classifier,
    pub learning: LearningHandle,
    pub limiter: RateLimiter,
    pub supervisor: Supervisor,
    pub publisher: Arc<Publisher>,
    pub registry: Arc<MetricsRegistry>,
}

impl Pipeline {
    /// Wire the full pipeline from a config store and a shell spec.
    /// Spawns the learning-store writer and the publisher owner task.
    pub fn new(
        config: Arc<ConfigStore>,
        shell: psgate_engine::ShellSpec,
    ) -> Result<Arc<Self>, PsgateError> {
        let snapshot = config.current();

        let learning = psgate_core::learning::LearningStore::spawn(&snapshot.data_dir)?;
        let (notice_tx, notice_rx) = tokio::sync::mpsc::unbounded_channel();
        let classifier = Classifier::new(config.clone(), learning.approved_view(), Some(notice_tx));

        let registry = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(psgate_core::event::EventBus::default());
        let publisher = Publisher::spawn(
            registry.clone(),
            bus,
            Some(learning.clone()),
            Some(notice_rx),
            psgate_metrics::PublisherOptions {
                disable_attempt_publish: snapshot.env.disable_attempt_publish,
                structured_audit: snapshot.logging.structured_audit,
                data_dir: snapshot.data_dir.clone(),
            },
        );

        let supervisor = Supervisor::new(
            shell,
            psgate_engine::SupervisorOptions {
                limits: snapshot.limits,
                disable_self_destruct: snapshot.env.disable_self_destruct,
                capture_process_metrics: snapshot.env.capture_ps_metrics,
            },
        );
        let limiter = RateLimiter::new(snapshot.rate_limit);

        Ok(Arc::new(Self {
            config,
            classifier,
            learning,
            limiter,
            supervisor,
            publisher,
            registry,
        }))
    }

    /// Run one command through rate limiting, classification, the
    /// confirmation gate, working-directory policy, supervised
    /// execution, and event publication.
    ///
    /// Policy rejections are not errors: they come back as
    /// outcome-shaped payloads with `success=false` and a `reason`.
    pub async fn run_command(
        &self,
        tool: &str,
        args: RunPowershellArgs,
        caller: &CallerInfo,
    ) -> Result<ToolOutput, PsgateError> {
        let snapshot = self.config.current();
        let (args, warnings) = args.normalize();
        let command = args.command_text()?.to_string();

        if let Err(retry_after_ms) = self.limiter.check(&caller.client_id) {
            self.publish_attempt(tool, &command, None, Decision::RateLimited, caller, None);
            let mut value = rejection_outcome("rate_limited", None, &warnings);
            value["retryAfterMs"] = json!(retry_after_ms);
            return Ok(ToolOutput::error(value));
        }

        let assessment = self.classifier.classify(&command);
        let flags = CallerFlags {
            confirmed: args.confirmed.unwrap_or(false),
            override_requested: args.override_requested.unwrap_or(false),
            operator_authenticated: caller.operator_authenticated,
        };

        match gate::decide(&assessment, flags, &snapshot) {
            GateDecision::Proceed => {}
            GateDecision::Reject(GateRejection::Blocked { ref category, .. }) => {
                info!(tool, category = %category, "Command blocked");
                self.publish_attempt(
                    tool,
                    &command,
                    Some(assessment.clone()),
                    Decision::Blocked,
                    caller,
                    None,
                );
                return Ok(ToolOutput::error(rejection_outcome(
                    "blocked",
                    Some(&assessment),
                    &warnings,
                )));
            }
            GateDecision::Reject(GateRejection::ConfirmationRequired { level, .. }) => {
                info!(tool, level = %level, "Confirmation required");
                self.publish_attempt(
                    tool,
                    &command,
                    Some(assessment.clone()),
                    Decision::ConfirmationRequired,
                    caller,
                    None,
                );
                return Ok(ToolOutput::error(rejection_outcome(
                    "confirmation_required",
                    Some(&assessment),
                    &warnings,
                )));
            }
        }

        let cwd = match workdir::resolve_and_check(
            args.working_directory.as_deref().map(std::path::Path::new),
            &snapshot,
        ) {
            Ok(cwd) => cwd,
            Err(e) => {
                warn!(tool, error = %e, "Working directory rejected");
                let reason = e.code().to_lowercase();
                self.publish_attempt(
                    tool,
                    &command,
                    Some(assessment.clone()),
                    Decision::PolicyError,
                    caller,
                    Some(reason.clone()),
                );
                return Ok(ToolOutput::error(rejection_outcome(
                    &reason,
                    Some(&assessment),
                    &warnings,
                )));
            }
        };

        self.publish_attempt(
            tool,
            &command,
            Some(assessment.clone()),
            Decision::Executed,
            caller,
            None,
        );

        let request = self.build_request(&args, &command, cwd, &snapshot);
        let outcome = self.supervisor.execute(request).await;

        let confirmed = flags.confirmed && assessment.requires_confirmation;
        self.publish_completion(tool, &assessment, &outcome, caller, confirmed);

        Ok(wire_outcome(
            &outcome,
            &assessment,
            &warnings,
            &snapshot.logging.truncate_indicator,
        ))
    }

    /// Classification without execution, for `threat-analysis`.
    pub fn classify_only(&self, command: &str) -> SecurityAssessment {
        self.classifier.classify(command)
    }

    fn build_request(
        &self,
        args: &RunPowershellArgs,
        command: &str,
        cwd: Option<PathBuf>,
        snapshot: &psgate_core::config::ConfigSnapshot,
    ) -> ExecutionRequest {
        let timeout_sec = snapshot.clamp_timeout_sec(args.ai_agent_timeout_sec);
        let adaptive = if args.progress_adaptive.unwrap_or(false) {
            Some(AdaptiveParams {
                extend_window_ms: args
                    .adaptive_extend_window_ms
                    .unwrap_or(snapshot.adaptive_defaults.extend_window_ms),
                extend_step_ms: args
                    .adaptive_extend_step_ms
                    .unwrap_or(snapshot.adaptive_defaults.extend_step_ms),
                max_total_sec: args
                    .adaptive_max_total_sec
                    .unwrap_or_else(|| AdaptiveParams::default_max_total_sec(timeout_sec)),
            })
        } else {
            None
        };

        ExecutionRequest {
            command_text: command.to_string(),
            cwd,
            timeout_sec,
            adaptive,
            overflow_strategy: snapshot.overflow_strategy(),
        }
    }

    fn publish_attempt(
        &self,
        tool: &str,
        command: &str,
        assessment: Option<SecurityAssessment>,
        decision: Decision,
        caller: &CallerInfo,
        note: Option<String>,
    ) {
        self.publisher.publish_attempt(CommandEvent {
            seq: 0,
            id: String::new(),
            timestamp: Utc::now(),
            kind: EventKind::Attempt,
            tool: tool.to_string(),
            preview: command.to_string(),
            assessment,
            decision,
            duration_ms: 0,
            confirmed: false,
            outcome: None,
            client_id: Some(caller.client_id.clone()),
            note,
        });
    }

    fn publish_completion(
        &self,
        tool: &str,
        assessment: &SecurityAssessment,
        outcome: &ExecutionOutcome,
        caller: &CallerInfo,
        confirmed: bool,
    ) {
        self.publisher.publish_completion(CommandEvent {
            seq: 0,
            id: String::new(),
            timestamp: Utc::now(),
            kind: EventKind::Completion,
            tool: tool.to_string(),
            preview: outcome.stdout(),
            assessment: Some(assessment.clone()),
            decision: Decision::Executed,
            duration_ms: outcome.duration_ms,
            confirmed,
            outcome: Some(OutcomeSummary::from(outcome)),
            client_id: Some(caller.client_id.clone()),
            note: None,
        });
    }
}

/// Outcome-shaped payload for policy rejections: agents can reason
/// about the decision without parsing JSON-RPC error codes.
fn rejection_outcome(
    reason: &str,
    assessment: Option<&SecurityAssessment>,
    warnings: &[String],
) -> Value {
    json!({
        "success": false,
        "reason": reason,
        "exitCode": null,
        "stdout": "",
        "stderr": "",
        "durationMs": 0,
        "timedOut": false,
        "overflow": false,
        "truncated": false,
        "totalBytes": 0,
        "warnings": warnings,
        "securityAssessment": assessment,
    })
}

/// The full §-outcome wire shape for executed commands.
fn wire_outcome(
    outcome: &ExecutionOutcome,
    assessment: &SecurityAssessment,
    warnings: &[String],
    truncate_indicator: &str,
) -> ToolOutput {
    let mut stdout = outcome.stdout();
    if outcome.truncated && !truncate_indicator.is_empty() {
        stdout.push('\n');
        stdout.push_str(truncate_indicator);
    }

    let mut value = json!({
        "success": outcome.success,
        "exitCode": outcome.exit_code,
        "stdout": stdout,
        "stderr": outcome.stderr(),
        "durationMs": outcome.duration_ms,
        "configuredTimeoutMs": outcome.configured_timeout_ms,
        "effectiveTimeoutMs": outcome.effective_timeout_ms,
        "adaptiveExtensions": outcome.adaptive_extensions,
        "adaptiveExtended": outcome.adaptive_extended,
        "adaptiveMaxTotalMs": outcome.adaptive_max_total_ms,
        "timedOut": outcome.timed_out,
        "overflow": outcome.overflow,
        "overflowStrategy": outcome.overflow_strategy,
        "truncated": outcome.truncated,
        "totalBytes": outcome.total_bytes,
        "terminationReason": outcome.termination_reason,
        "internalSelfDestruct": outcome.internal_self_destruct,
        "watchdogTriggered": outcome.watchdog_triggered,
        "killEscalated": outcome.kill_escalated,
        "warnings": warnings,
        "securityAssessment": assessment,
    });
    if let Some(reason) = &outcome.reason {
        value["reason"] = json!(reason);
    }

    if outcome.success {
        ToolOutput::ok(value)
    } else {
        ToolOutput::error(value)
    }
}
