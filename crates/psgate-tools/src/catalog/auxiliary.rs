use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use psgate_core::error::{PsgateError, Result};
use psgate_core::gate::{self, CallerFlags, GateDecision};
use psgate_core::normalize::normalize;
use psgate_core::types::Tier;

use crate::args::{EmitLogArgs, ThreatAnalysisArgs};
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Classify a command and report the verdict without executing it.
pub struct ThreatAnalysisTool;

impl Tool for ThreatAnalysisTool {
    fn name(&self) -> &str {
        "threat-analysis"
    }

    fn description(&self) -> &str {
        "Classify a command and explain the verdict (tier, category, matched pattern) without executing anything."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command to analyze" }
            },
            "required": ["command"]
        })
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args: ThreatAnalysisArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;
            let assessment = ctx.pipeline.classify_only(&args.command);
            Ok(ToolOutput::ok(json!({
                "assessment": assessment,
                "wouldExecute": !assessment.blocked && !assessment.requires_confirmation,
                "normalized": normalize(&args.command),
            })))
        })
    }
}

/// Canned guidance for agents driving this gateway.
pub struct AgentPromptsTool;

impl Tool for AgentPromptsTool {
    fn name(&self) -> &str {
        "agent-prompts"
    }

    fn description(&self) -> &str {
        "Guidance strings for agents: how confirmation, timeouts, and blocked tiers behave."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    fn call(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            Ok(ToolOutput::ok(json!({
                "prompts": [
                    "Prefer read-only cmdlets (Get-*, Test-*) — they execute without confirmation.",
                    "RISKY and UNKNOWN commands are rejected with reason=confirmation_required; retry with confirmed:true after the user approves.",
                    "Commands with reason=blocked are never executable; do not retry them.",
                    "For long-running commands that stream output, set progressAdaptive:true instead of a large timeout.",
                    "Keep output small: use Select-Object and -First to stay under the output caps.",
                ]
            })))
        })
    }
}

/// Write a caller-supplied message into the audit stream.
pub struct EmitLogTool;

impl Tool for EmitLogTool {
    fn name(&self) -> &str {
        "emit-log"
    }

    fn description(&self) -> &str {
        "Append a caller-supplied message to the audit event stream."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "level": { "type": "string", "enum": ["info", "warn"] }
            },
            "required": ["message"]
        })
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args: EmitLogArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;
            let cap = ctx.pipeline.config.current().logging.max_log_message_chars;
            let mut message = args.message;
            let mut truncated = false;
            if message.chars().count() > cap {
                message = message.chars().take(cap).collect();
                truncated = true;
            }
            let level = args.level.as_deref().unwrap_or("info");
            info!(client = %ctx.caller.client_id, level, "emit-log: {}", message);
            ctx.pipeline
                .publisher
                .publish_audit(format!("AGENT_LOG level={} {}", level, message));
            Ok(ToolOutput::ok(json!({ "logged": true, "truncated": truncated })))
        })
    }
}

/// Render the tool catalog.
pub struct HelpTool;

impl Tool for HelpTool {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "List every tool with its description."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    fn call(
        &self,
        _input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let tools: Vec<_> = ctx
                .catalog
                .iter()
                .map(|d| json!({ "name": d.name, "description": d.description }))
                .collect();
            Ok(ToolOutput::ok(json!({ "tools": tools })))
        })
    }
}

/// Built-in self checks over the classifier and gate invariants.
pub struct AiAgentTestsTool;

impl Tool for AiAgentTestsTool {
    fn name(&self) -> &str {
        "ai-agent-tests"
    }

    fn description(&self) -> &str {
        "Run the built-in classifier and gate self-checks and report pass/fail counts."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    fn call(
        &self,
        _input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let snapshot = ctx.pipeline.config.current();
            let classify = |cmd: &str| ctx.pipeline.classify_only(cmd);

            let mut results = Vec::new();
            let mut check = |name: &str, ok: bool, detail: String| {
                results.push(json!({ "name": name, "ok": ok, "detail": detail }));
            };

            let a = classify("Get-Date");
            check(
                "safe_read_only",
                a.level == Tier::Safe && !a.blocked,
                format!("Get-Date -> {}", a.level),
            );

            let a = classify("git push --force origin main");
            check(
                "critical_blocks",
                a.blocked,
                format!("force push -> {} ({})", a.level, a.category),
            );

            let a = classify("Remove-Item ./x.txt");
            check(
                "risky_requires_confirmation",
                a.requires_confirmation && !a.blocked,
                format!("Remove-Item -> {}", a.level),
            );

            let a = classify("totally-unknown-tool --x");
            check(
                "unknown_bucket",
                a.level == Tier::Unknown,
                format!("unknown -> {}", a.level),
            );

            let a = classify("git push --force origin main");
            let d = gate::decide(
                &a,
                CallerFlags {
                    confirmed: true,
                    ..Default::default()
                },
                &snapshot,
            );
            check(
                "confirmation_never_unblocks",
                matches!(d, GateDecision::Reject(_)),
                "confirmed blocked command still rejected".to_string(),
            );

            check(
                "normalization_strips_literals",
                normalize("Remove-Item 'C:\\a.txt'") == normalize("remove-item  'D:/b.log'"),
                "literal-stripped forms collide".to_string(),
            );

            let failed = results
                .iter()
                .filter(|r| r["ok"] == json!(false))
                .count();
            Ok(ToolOutput::ok(json!({
                "passed": results.len() - failed,
                "failed": failed,
                "results": results,
            })))
        })
    }
}
