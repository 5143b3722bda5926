use futures::future::BoxFuture;
use serde_json::json;

use psgate_core::error::{PsgateError, Result};

use crate::args::{LearnAction, LearnArgs};
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Operator surface for the learning store: inspect the candidate
/// queue, queue forms manually, promote them to learned-safe, or drop
/// them.
pub struct LearnTool;

impl Tool for LearnTool {
    fn name(&self) -> &str {
        "learn"
    }

    fn description(&self) -> &str {
        "Manage the unknown-command learning queue: list, queue, approve, or remove normalized command forms."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["list", "queue", "approve", "remove"] },
                "normalized": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Normalized command forms the action applies to"
                }
            },
            "required": ["action"]
        })
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args: LearnArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;
            let learning = &ctx.pipeline.learning;

            match args.action {
                LearnAction::List => {
                    let queue = learning.list_queue().await?;
                    Ok(ToolOutput::ok(json!({
                        "queue": queue,
                        "approvedVersion": learning.approved_version(),
                    })))
                }
                LearnAction::Queue => {
                    require_normalized(&args)?;
                    let mut added = 0u32;
                    let mut skipped = 0u32;
                    for n in &args.normalized {
                        let outcome = learning
                            .queue(&psgate_core::normalize::normalize(n), "operator")
                            .await?;
                        if outcome.added {
                            added += 1;
                        } else {
                            skipped += 1;
                        }
                    }
                    Ok(ToolOutput::ok(json!({ "added": added, "skipped": skipped })))
                }
                LearnAction::Approve => {
                    require_normalized(&args)?;
                    let outcome = learning.approve(args.normalized.clone(), "operator").await?;
                    Ok(ToolOutput::ok(json!({
                        "promoted": outcome.promoted,
                        "notFound": outcome.not_found,
                    })))
                }
                LearnAction::Remove => {
                    require_normalized(&args)?;
                    let removed = learning.remove(args.normalized.clone()).await?;
                    Ok(ToolOutput::ok(json!({ "removed": removed })))
                }
            }
        })
    }
}

fn require_normalized(args: &LearnArgs) -> Result<()> {
    if args.normalized.is_empty() {
        return Err(PsgateError::InvalidArgs(
            "'normalized' must list at least one command form".into(),
        ));
    }
    Ok(())
}
