use futures::future::BoxFuture;

use psgate_core::error::{PsgateError, Result};

use crate::args::RunPowershellArgs;
use crate::tool::{Tool, ToolContext, ToolOutput};

pub struct RunPowershellTool;

impl Tool for RunPowershellTool {
    fn name(&self) -> &str {
        "run-powershell"
    }

    fn description(&self) -> &str {
        "Execute a PowerShell command under security policy. Risky commands require confirmed:true; dangerous commands are blocked."
    }

    fn input_schema(&self) -> serde_json::Value {
        run_schema(false)
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let args = RunPowershellArgs::parse(input)?;
            if args.script_file.is_some() {
                return Err(PsgateError::InvalidArgs(
                    "'scriptFile' is only accepted by run-powershellscript".into(),
                ));
            }
            ctx.pipeline
                .run_command("run-powershell", args, &ctx.caller)
                .await
        })
    }
}

pub struct RunPowershellScriptTool;

impl Tool for RunPowershellScriptTool {
    fn name(&self) -> &str {
        "run-powershellscript"
    }

    fn description(&self) -> &str {
        "Execute a PowerShell script (inline or from a file) under the same security policy as run-powershell."
    }

    fn input_schema(&self) -> serde_json::Value {
        run_schema(true)
    }

    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let mut args = RunPowershellArgs::parse(input)?;
            // Inline the script file before classification so the
            // classifier sees what will actually run.
            if let Some(path) = args.script_file.take() {
                if args.command.is_none() && args.script.is_none() {
                    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                        PsgateError::InvalidArgs(format!("cannot read scriptFile {}: {}", path, e))
                    })?;
                    args.script = Some(content);
                }
            }
            ctx.pipeline
                .run_command("run-powershellscript", args, &ctx.caller)
                .await
        })
    }
}

fn run_schema(with_script_file: bool) -> serde_json::Value {
    let mut properties = serde_json::json!({
        "command": {
            "type": "string",
            "description": "PowerShell command to execute"
        },
        "script": {
            "type": "string",
            "description": "Multi-line PowerShell script to execute"
        },
        "workingDirectory": {
            "type": "string",
            "description": "Working directory; validated against the configured allowed roots"
        },
        "aiAgentTimeoutSec": {
            "type": "integer",
            "description": "Timeout in seconds (clamped to the configured maximum)"
        },
        "confirmed": {
            "type": "boolean",
            "description": "Confirm execution of RISKY or UNKNOWN commands"
        },
        "progressAdaptive": {
            "type": "boolean",
            "description": "Extend the timeout while output is actively produced"
        },
        "adaptiveExtendWindowMs": { "type": "integer" },
        "adaptiveExtendStepMs": { "type": "integer" },
        "adaptiveMaxTotalSec": { "type": "integer" },
        "override": {
            "type": "boolean",
            "description": "Operator override request; ignored unless operator auth is configured"
        }
    });
    if with_script_file {
        properties["scriptFile"] = serde_json::json!({
            "type": "string",
            "description": "Path to a script file, inlined before classification"
        });
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
    })
}
