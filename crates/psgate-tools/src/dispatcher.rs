use std::sync::Arc;

use tracing::debug;

use psgate_core::error::{PsgateError, Result};

use crate::pipeline::{CallerInfo, Pipeline};
use crate::tool::{ToolContext, ToolDefinition, ToolOutput, ToolRegistry};

/// Routes tool calls into the pipeline. This is the only entry point:
/// every caller goes through `dispatch` so audit and metrics see every
/// decision.
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    tools: ToolRegistry,
    catalog: Arc<Vec<ToolDefinition>>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let tools = ToolRegistry::with_builtins();
        let catalog = Arc::new(tools.definitions());
        Self {
            pipeline,
            tools,
            catalog,
        }
    }

    /// Tool definitions for `tools/list`.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.catalog.as_ref().clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Validate and route one tool call.
    pub async fn dispatch(
        &self,
        name: &str,
        input: serde_json::Value,
        caller: CallerInfo,
    ) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| PsgateError::ToolNotFound(name.to_string()))?;

        debug!(tool = name, client = %caller.client_id, "Dispatching tool call");
        let ctx = ToolContext {
            pipeline: self.pipeline.clone(),
            caller,
            catalog: self.catalog.clone(),
        };
        tool.call(input, ctx).await
    }
}
