use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use psgate_core::error::{PsgateError, Result};

use crate::args::{WorkdirAction, WorkdirPolicyArgs};
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Inspect or mutate the working-directory policy at runtime.
/// Mutations publish a rebuilt config snapshot and an audit note.
pub struct WorkdirPolicyTool;

impl Tool for WorkdirPolicyTool {
    fn name(&self) -> &str {
        "working-directory-policy"
    }

    fn description(&self) -> &str {
        "Get or set working-directory enforcement and the allowed write roots."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["get", "set"] },
                "enabled": { "type": "boolean" },
                "allowedWriteRoots": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Roots that workingDirectory must fall under; ${TEMP} expands"
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
            let args: WorkdirPolicyArgs = serde_json::from_value(input)
                .map_err(|e| PsgateError::InvalidArgs(e.to_string()))?;

            match args.action {
                WorkdirAction::Get => {
                    let snapshot = ctx.pipeline.config.current();
                    Ok(ToolOutput::ok(json!({
                        "enabled": snapshot.security.enforce_working_directory,
                        "allowedWriteRoots": snapshot.security.allowed_write_roots,
                    })))
                }
                WorkdirAction::Set => {
                    if args.enabled.is_none() && args.allowed_write_roots.is_none() {
                        return Err(PsgateError::InvalidArgs(
                            "'set' needs 'enabled' and/or 'allowedWriteRoots'".into(),
                        ));
                    }
                    let snapshot = ctx.pipeline.config.update(|config| {
                        if let Some(enabled) = args.enabled {
                            config.security.enforce_working_directory = enabled;
                        }
                        if let Some(roots) = args.allowed_write_roots.clone() {
                            config.security.allowed_write_roots = roots;
                        }
                    })?;
                    info!(
                        enabled = snapshot.security.enforce_working_directory,
                        roots = snapshot.security.allowed_write_roots.len(),
                        "Working-directory policy updated"
                    );
                    ctx.pipeline.publisher.publish_audit(format!(
                        "WORKING_DIRECTORY_POLICY_UPDATED enabled={} roots={}",
                        snapshot.security.enforce_working_directory,
                        snapshot.security.allowed_write_roots.join(";"),
                    ));
                    Ok(ToolOutput::ok(json!({
                        "enabled": snapshot.security.enforce_working_directory,
                        "allowedWriteRoots": snapshot.security.allowed_write_roots,
                    })))
                }
            }
        })
    }
}
