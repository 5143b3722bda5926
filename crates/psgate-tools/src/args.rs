use serde::Deserialize;

use psgate_core::error::{PsgateError, Result};

/// Arguments for `run-powershell` and `run-powershellscript`.
///
/// The deprecated `timeout` and `aiAgentTimeout` aliases are accepted
/// here and folded into `aiAgentTimeoutSec` at the dispatcher boundary;
/// each use appends a warning to the outcome.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPowershellArgs {
    pub command: Option<String>,
    pub script: Option<String>,
    pub script_file: Option<String>,
    pub working_directory: Option<String>,
    pub ai_agent_timeout_sec: Option<u64>,
    pub confirmed: Option<bool>,
    pub progress_adaptive: Option<bool>,
    pub adaptive_extend_window_ms: Option<u64>,
    pub adaptive_extend_step_ms: Option<u64>,
    pub adaptive_max_total_sec: Option<u64>,
    #[serde(rename = "override")]
    pub override_requested: Option<bool>,

    // Deprecated aliases
    pub timeout: Option<u64>,
    pub ai_agent_timeout: Option<u64>,
}

impl RunPowershellArgs {
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PsgateError::InvalidArgs(e.to_string()))
    }

    /// Fold deprecated aliases into the canonical field.
    /// Returns warnings describing each normalization applied.
    pub fn normalize(mut self) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        if self.ai_agent_timeout_sec.is_none() {
            if let Some(v) = self.ai_agent_timeout.take() {
                self.ai_agent_timeout_sec = Some(v);
                warnings
                    .push("'aiAgentTimeout' is deprecated; use 'aiAgentTimeoutSec'".to_string());
            } else if let Some(v) = self.timeout.take() {
                self.ai_agent_timeout_sec = Some(v);
                warnings.push("'timeout' is deprecated; use 'aiAgentTimeoutSec'".to_string());
            }
        } else {
            let dropped_alias = self.ai_agent_timeout.take().is_some();
            let dropped_timeout = self.timeout.take().is_some();
            if dropped_alias || dropped_timeout {
                warnings.push(
                    "deprecated timeout alias ignored in favor of 'aiAgentTimeoutSec'".to_string(),
                );
            }
        }
        (self, warnings)
    }

    /// The command text to classify and run: `command` or `script`,
    /// with `scriptFile` already inlined by the tool layer.
    pub fn command_text(&self) -> Result<&str> {
        self.command
            .as_deref()
            .or(self.script.as_deref())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                PsgateError::InvalidArgs("one of 'command' or 'script' is required".into())
            })
    }
}

/// Arguments for `powershell-syntax-check`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntaxCheckArgs {
    pub script: Option<String>,
    pub file_path: Option<String>,
}

/// Arguments for `working-directory-policy`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkdirPolicyArgs {
    pub action: WorkdirAction,
    pub enabled: Option<bool>,
    pub allowed_write_roots: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkdirAction {
    Get,
    Set,
}

/// Arguments for `server-stats`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatsArgs {
    #[serde(default)]
    pub verbose: bool,
}

/// Arguments for `learn`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnArgs {
    pub action: LearnAction,
    #[serde(default)]
    pub normalized: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnAction {
    List,
    Queue,
    Approve,
    Remove,
}

/// Arguments for `threat-analysis`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatAnalysisArgs {
    pub command: String,
}

/// Arguments for `emit-log`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitLogArgs {
    pub message: String,
    #[serde(default)]
    pub level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_canonical_fields() {
        let args = RunPowershellArgs::parse(json!({
            "command": "Get-Date",
            "aiAgentTimeoutSec": 30,
            "confirmed": true,
            "progressAdaptive": true,
            "override": false
        }))
        .unwrap();
        assert_eq!(args.command.as_deref(), Some("Get-Date"));
        assert_eq!(args.ai_agent_timeout_sec, Some(30));
        assert_eq!(args.confirmed, Some(true));
        assert_eq!(args.override_requested, Some(false));
    }

    #[test]
    fn timeout_alias_folds_with_warning() {
        let args = RunPowershellArgs::parse(json!({
            "command": "Get-Date",
            "timeout": 15
        }))
        .unwrap();
        let (args, warnings) = args.normalize();
        assert_eq!(args.ai_agent_timeout_sec, Some(15));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("deprecated"));
    }

    #[test]
    fn ai_agent_timeout_alias_folds() {
        let args = RunPowershellArgs::parse(json!({
            "command": "Get-Date",
            "aiAgentTimeout": 20
        }))
        .unwrap();
        let (args, warnings) = args.normalize();
        assert_eq!(args.ai_agent_timeout_sec, Some(20));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn canonical_field_wins_over_alias() {
        let args = RunPowershellArgs::parse(json!({
            "command": "Get-Date",
            "aiAgentTimeoutSec": 30,
            "timeout": 5
        }))
        .unwrap();
        let (args, warnings) = args.normalize();
        assert_eq!(args.ai_agent_timeout_sec, Some(30));
        assert!(warnings[0].contains("ignored"));
    }

    #[test]
    fn no_warnings_without_aliases() {
        let args = RunPowershellArgs::parse(json!({ "command": "Get-Date" })).unwrap();
        let (_, warnings) = args.normalize();
        assert!(warnings.is_empty());
    }

    #[test]
    fn command_or_script_required() {
        let args = RunPowershellArgs::parse(json!({})).unwrap();
        assert!(matches!(
            args.command_text(),
            Err(PsgateError::InvalidArgs(_))
        ));

        let args = RunPowershellArgs::parse(json!({ "script": "Get-Date" })).unwrap();
        assert_eq!(args.command_text().unwrap(), "Get-Date");
    }

    #[test]
    fn learn_action_parses() {
        let args: LearnArgs =
            serde_json::from_value(json!({ "action": "approve", "normalized": ["x"] })).unwrap();
        assert_eq!(args.action, LearnAction::Approve);
    }
}
