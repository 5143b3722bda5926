use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use psgate_core::error::Result;

use crate::pipeline::{CallerInfo, Pipeline};

/// Result of a tool call: a JSON payload plus an error marker the
/// transport maps onto the MCP `isError` flag.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub value: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    pub fn error(value: serde_json::Value) -> Self {
        Self {
            value,
            is_error: true,
        }
    }
}

/// Context passed to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub pipeline: Arc<Pipeline>,
    pub caller: CallerInfo,
    /// Catalog definitions, for tools that render the tool list.
    pub catalog: Arc<Vec<ToolDefinition>>,
}

/// One logical tool in the catalog.
pub trait Tool: Send + Sync + 'static {
    /// Tool name as exposed over the wire.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn call(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>>;
}

/// Tool definition for `tools/list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Fixed catalog of tools, keyed by name. Iteration order is stable so
/// `tools/list` and `help` render deterministically.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Create a registry with the full built-in catalog registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(crate::catalog::run_powershell::RunPowershellTool);
        registry.register(crate::catalog::run_powershell::RunPowershellScriptTool);
        registry.register(crate::catalog::syntax_check::SyntaxCheckTool);
        registry.register(crate::catalog::workdir_policy::WorkdirPolicyTool);
        registry.register(crate::catalog::server_stats::ServerStatsTool);
        registry.register(crate::catalog::learn::LearnTool);
        registry.register(crate::catalog::auxiliary::ThreatAnalysisTool);
        registry.register(crate::catalog::auxiliary::AgentPromptsTool);
        registry.register(crate::catalog::auxiliary::EmitLogTool);
        registry.register(crate::catalog::auxiliary::HelpTool);
        registry.register(crate::catalog::auxiliary::AiAgentTestsTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
