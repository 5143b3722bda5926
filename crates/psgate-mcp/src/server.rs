use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use psgate_core::error::Result;
use psgate_tools::{CallerInfo, Dispatcher};

use crate::framing::FrameCodec;
use crate::protocol::{
    code_for, JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};

/// JSON-RPC 2.0 server over length-prefixed frames. One session per
/// transport; the session tracks client identity and operator
/// authentication from `initialize`.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    auth_key: Option<String>,
}

struct Session {
    caller: CallerInfo,
    initialized: bool,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, auth_key: Option<String>) -> Self {
        Self {
            dispatcher,
            auth_key,
        }
    }

    /// Serve stdin/stdout until EOF or shutdown.
    pub async fn serve_stdio(&self, shutdown: CancellationToken) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    pub async fn serve<R, W>(&self, reader: R, writer: W, shutdown: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        let mut sink = FramedWrite::new(writer, FrameCodec::default());
        let mut session = Session {
            caller: CallerInfo::default(),
            initialized: false,
        };

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Transport shutting down");
                    break;
                }
                frame = frames.next() => frame,
            };
            let Some(frame) = frame else {
                info!("Transport closed by peer");
                break;
            };
            let frame = frame?;

            let response = match serde_json::from_slice::<JsonRpcRequest>(&frame) {
                Ok(request) => {
                    if request.is_notification() {
                        debug!(method = %request.method, "Notification");
                        continue;
                    }
                    Some(self.handle(request, &mut session).await)
                }
                Err(e) => Some(JsonRpcResponse::failure(
                    Value::Null,
                    PARSE_ERROR,
                    format!("malformed request: {}", e),
                )),
            };

            if let Some(response) = response {
                let payload = serde_json::to_string(&response)?;
                sink.send(payload).await?;
            }
        }
        Ok(())
    }

    async fn handle(&self, request: JsonRpcRequest, session: &mut Session) -> JsonRpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, &request.params, session),
            "tools/list" => JsonRpcResponse::success(
                id,
                json!({ "tools": self.dispatcher.definitions() }),
            ),
            "tools/call" => self.handle_tool_call(id, &request.params, session).await,
            other => {
                warn!(method = other, "Unknown method");
                JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method: {}", other))
            }
        }
    }

    fn handle_initialize(
        &self,
        id: Value,
        params: &Value,
        session: &mut Session,
    ) -> JsonRpcResponse {
        if let Some(name) = params
            .get("clientInfo")
            .and_then(|c| c.get("name"))
            .and_then(|n| n.as_str())
        {
            session.caller.client_id = name.to_string();
        }

        // Operator override is only honored for sessions presenting
        // the configured key at initialize.
        if let Some(expected) = &self.auth_key {
            let presented = params.get("authKey").and_then(|k| k.as_str());
            session.caller.operator_authenticated = presented == Some(expected.as_str());
            if !session.caller.operator_authenticated && presented.is_some() {
                warn!(client = %session.caller.client_id, "Bad auth key presented");
            }
        }
        session.initialized = true;
        info!(
            client = %session.caller.client_id,
            operator = session.caller.operator_authenticated,
            "Session initialized"
        );

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "psgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
            }),
        )
    }

    async fn handle_tool_call(
        &self,
        id: Value,
        params: &Value,
        session: &Session,
    ) -> JsonRpcResponse {
        if !session.initialized {
            debug!("tools/call before initialize; proceeding with defaults");
        }
        let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
            return JsonRpcResponse::failure(id, INVALID_REQUEST, "missing tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        match self
            .dispatcher
            .dispatch(name, arguments, session.caller.clone())
            .await
        {
            Ok(output) => {
                let text = serde_json::to_string(&output.value).unwrap_or_default();
                JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "isError": output.is_error,
                    }),
                )
            }
            Err(e) => JsonRpcResponse::failure(id, code_for(&e), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psgate_core::config::{AppConfig, ConfigStore, EnvOverrides};
    use psgate_engine::ShellSpec;
    use psgate_tools::Pipeline;

    fn server(dir: &std::path::Path, auth_key: Option<&str>) -> McpServer {
        let mut config = AppConfig::default();
        config.data_dir = Some(dir.to_path_buf());
        config.rate_limit.enabled = false;
        let store = Arc::new(ConfigStore::new(config, EnvOverrides::default()).unwrap());
        let pipeline = Pipeline::new(store, ShellSpec::posix()).unwrap();
        McpServer::new(
            Arc::new(Dispatcher::new(pipeline)),
            auth_key.map(|s| s.to_string()),
        )
    }

    fn request(id: u64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: Some("2.0".into()),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    fn fresh_session() -> Session {
        Session {
            caller: CallerInfo::default(),
            initialized: false,
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();

        let resp = server
            .handle(
                request(1, "initialize", json!({ "clientInfo": { "name": "agent-x" } })),
                &mut session,
            )
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], json!("psgate"));
        assert_eq!(result["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(session.caller.client_id, "agent-x");
        assert!(!session.caller.operator_authenticated);
    }

    #[tokio::test]
    async fn auth_key_marks_operator() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), Some("sekrit"));
        let mut session = fresh_session();

        server
            .handle(
                request(1, "initialize", json!({ "authKey": "sekrit" })),
                &mut session,
            )
            .await;
        assert!(session.caller.operator_authenticated);

        let mut session = fresh_session();
        server
            .handle(
                request(1, "initialize", json!({ "authKey": "wrong" })),
                &mut session,
            )
            .await;
        assert!(!session.caller.operator_authenticated);
    }

    #[tokio::test]
    async fn tools_list_exposes_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();

        let resp = server.handle(request(2, "tools/list", json!({})), &mut session).await;
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"run-powershell"));
        assert!(names.contains(&"learn"));
        assert!(names.contains(&"server-stats"));
        assert!(tools.iter().all(|t| t.get("inputSchema").is_some()));
    }

    #[tokio::test]
    async fn tools_call_runs_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();

        let resp = server
            .handle(
                request(
                    3,
                    "tools/call",
                    json!({ "name": "run-powershell", "arguments": { "command": "echo rpc-ok" } }),
                ),
                &mut session,
            )
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(false));
        let text = result["content"][0]["text"].as_str().unwrap();
        let outcome: Value = serde_json::from_str(text).unwrap();
        assert_eq!(outcome["success"], json!(true));
        assert!(outcome["stdout"].as_str().unwrap().contains("rpc-ok"));
    }

    #[tokio::test]
    async fn blocked_command_is_a_successful_response() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();

        let resp = server
            .handle(
                request(
                    4,
                    "tools/call",
                    json!({
                        "name": "run-powershell",
                        "arguments": { "command": "git push --force origin main" }
                    }),
                ),
                &mut session,
            )
            .await;
        // Policy rejection: JSON-RPC success carrying an outcome-shaped
        // payload, not a protocol error.
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        let outcome: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(outcome["reason"], json!("blocked"));
    }

    #[tokio::test]
    async fn invalid_args_map_to_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();

        let resp = server
            .handle(
                request(5, "tools/call", json!({ "name": "run-powershell", "arguments": {} })),
                &mut session,
            )
            .await;
        assert_eq!(resp.error.unwrap().code, crate::protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);
        let mut session = fresh_session();
        let resp = server.handle(request(6, "resources/list", json!({})), &mut session).await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_handles_framed_session() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), None);

        let mut input = Vec::new();
        for payload in [
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        ] {
            input.extend_from_slice(
                format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload).as_bytes(),
            );
        }

        let mut output = Vec::new();
        server
            .serve(&input[..], &mut output, CancellationToken::new())
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        // Two responses: initialize and tools/list; the notification got none.
        assert_eq!(text.matches("Content-Length:").count(), 2);
        assert!(text.contains("\"protocolVersion\""));
        assert!(text.contains("run-powershell"));
    }
}
