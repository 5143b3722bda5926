use futures::future::BoxFuture;
use serde_json::json;

use psgate_core::error::{PsgateError, Result};

use crate::args::ServerStatsArgs;
use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct ServerStatsTool;

impl Tool for ServerStatsTool {
    fn name(&self) -> &str {
        "server-stats"
    }

    fn description(&self) -> &str {
        "Current metrics snapshot: command counters, latency aggregates, and (verbose) per-tier and process stats."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "verbose": { "type": "boolean", "default": false }
            }
        })
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args: ServerStatsArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;
            let snapshot = ctx.pipeline.registry.snapshot();

            if args.verbose {
                return Ok(ToolOutput::ok(serde_json::to_value(&snapshot)?));
            }
            Ok(ToolOutput::ok(json!({
                "totalCommands": snapshot.total_commands,
                "executionCommands": snapshot.execution_commands,
                "blocked": snapshot.blocked,
                "confirmationRequired": snapshot.confirmation_required,
                "timeouts": snapshot.timeouts,
                "averageDurationMs": snapshot.average_duration_ms,
                "p95DurationMs": snapshot.p95_duration_ms,
            })))
        })
    }
}
