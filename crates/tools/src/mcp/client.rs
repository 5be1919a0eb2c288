use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sisypho_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use super::outcome::{CallError, CallOutcome, ToolPayload};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─── JSON-RPC types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

/// Anything the backend writes: a response, or a notification we skip.
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

// ─── Tool schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Ready => "ready",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a single request/response exchange did not produce a result.
#[derive(Debug)]
enum RpcFailure {
    /// Backend closed its output (empty read) or its input pipe broke.
    Closed,
    Io(String),
    Protocol(String),
    /// Backend answered with an error field; the connection is still usable.
    Remote(String),
}

impl RpcFailure {
    fn breaks_connection(&self) -> bool {
        !matches!(self, RpcFailure::Remote(_))
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Closed => f.write_str("backend closed the connection"),
            RpcFailure::Io(e) => write!(f, "I/O error: {}", e),
            RpcFailure::Protocol(e) => write!(f, "protocol error: {}", e),
            RpcFailure::Remote(e) => f.write_str(e),
        }
    }
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

// ─── MCP Client ───────────────────────────────────────────────────────────────

/// Client for one backend process speaking newline-delimited JSON-RPC on stdio.
///
/// Exactly one request is in flight at a time: every exchange writes a line and
/// then reads until the matching response. Methods take `&mut self`, so callers
/// sharing a client serialize through a lock.
pub struct McpClient {
    name: String,
    argv: Vec<String>,
    state: ConnectionState,
    next_id: u64,
    last_id: Option<u64>,
    tools: Vec<ToolDescriptor>,
    pipes: Option<Pipes>,
    shutdown_grace: Duration,
    response_timeout: Option<Duration>,
}

impl McpClient {
    /// `command_line` is split on whitespace into program and arguments.
    pub fn new(name: &str, command_line: &str) -> Self {
        Self {
            name: name.to_string(),
            argv: command_line.split_whitespace().map(str::to_string).collect(),
            state: ConnectionState::Stopped,
            next_id: 1,
            last_id: None,
            tools: Vec::new(),
            pipes: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            response_timeout: None,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Id of the most recently sent request, if any.
    pub fn last_request_id(&self) -> Option<u64> {
        self.last_id
    }

    /// Cached tool list from the last successful handshake.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool_name)
    }

    /// Spawn the backend and run the initialize / initialized / tools/list handshake.
    pub async fn start(&mut self) -> Result<()> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        if self.pipes.is_some() {
            // Leftover process from a failed connection.
            self.stop().await;
        }

        self.state = ConnectionState::Starting;
        match self.handshake().await {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                info!(backend = %self.name, tools = self.tools.len(), "MCP backend ready");
                Ok(())
            }
            Err(e) => {
                error!(backend = %self.name, error = %e, "MCP backend failed to start");
                self.stop().await;
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            Error::Transport(format!("MCP[{}]: empty command line", self.name))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!(
                "MCP[{}]: failed to spawn '{}': {}",
                self.name, program, e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport(format!("MCP[{}]: no stdin", self.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport(format!("MCP[{}]: no stdout", self.name)))?;
        self.pipes = Some(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "sisypho",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let init = self
            .exchange("initialize", Some(params))
            .await
            .map_err(|e| Error::Transport(format!("MCP[{}]: initialize: {}", self.name, e)))?;
        debug!(backend = %self.name, server_info = ?init.get("serverInfo"), "MCP initialized");

        self.notify("notifications/initialized")
            .await
            .map_err(|e| Error::Transport(format!("MCP[{}]: initialized: {}", self.name, e)))?;

        let listed = self
            .exchange("tools/list", None)
            .await
            .map_err(|e| Error::Transport(format!("MCP[{}]: tools/list: {}", self.name, e)))?;
        let tools: Vec<ToolDescriptor> = serde_json::from_value(
            listed.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| Error::Transport(format!("MCP[{}]: parse tools: {}", self.name, e)))?;
        debug!(backend = %self.name, count = tools.len(), "MCP tools loaded");
        self.tools = tools;
        Ok(())
    }

    /// Start lazily, then return the cached tool list.
    pub async fn list_tools(&mut self) -> Result<&[ToolDescriptor]> {
        self.start().await?;
        Ok(&self.tools)
    }

    /// Call `tools/call`. Never returns an error: every outcome is a `CallOutcome`.
    pub async fn call(&mut self, tool_name: &str, arguments: Value) -> CallOutcome {
        if self.state != ConnectionState::Ready {
            if let Err(e) = self.start().await {
                return CallOutcome::Failed(CallError::Transport(e.to_string()));
            }
        }

        let params = json!({
            "name": tool_name,
            "arguments": arguments
        });
        match self.exchange("tools/call", Some(params)).await {
            Ok(result) => parse_call_result(&result),
            Err(RpcFailure::Remote(msg)) => {
                warn!(backend = %self.name, tool = tool_name, error = %msg, "MCP tool error");
                CallOutcome::Failed(CallError::Tool(msg))
            }
            Err(RpcFailure::Closed) => {
                error!(backend = %self.name, tool = tool_name, "MCP connection lost");
                CallOutcome::Failed(CallError::ConnectionLost(self.name.clone()))
            }
            Err(other) => {
                error!(backend = %self.name, tool = tool_name, error = %other, "MCP transport failure");
                CallOutcome::Failed(CallError::Transport(format!("MCP[{}]: {}", self.name, other)))
            }
        }
    }

    /// Best-effort shutdown: notify, close stdin, wait out the grace period, then kill.
    /// Always leaves the client `Stopped`.
    pub async fn stop(&mut self) {
        let Some(pipes) = self.pipes.take() else {
            self.state = ConnectionState::Stopped;
            return;
        };
        self.state = ConnectionState::Stopping;

        let Pipes {
            mut child,
            mut stdin,
            stdout,
        } = pipes;
        if let Ok(line) = serde_json::to_string(&JsonRpcNotification {
            jsonrpc: "2.0",
            method: "notifications/shutdown",
        }) {
            let _ = write_line(&mut stdin, &line).await;
        }
        drop(stdin);
        drop(stdout);

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(backend = %self.name, %status, "MCP backend exited"),
            Ok(Err(e)) => warn!(backend = %self.name, error = %e, "MCP backend wait failed"),
            Err(_) => {
                warn!(backend = %self.name, "MCP backend ignored shutdown, killing");
                if let Err(e) = child.kill().await {
                    warn!(backend = %self.name, error = %e, "MCP backend kill failed");
                }
            }
        }
        self.state = ConnectionState::Stopped;
    }

    /// One request, one response. Transport-level failures mark the connection `Failed`.
    async fn exchange(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcFailure> {
        let id = self.next_id;
        self.next_id += 1;
        self.last_id = Some(id);

        let line = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|e| RpcFailure::Protocol(format!("serialize: {}", e)))?;
        debug!(backend = %self.name, id, method, "MCP → request");

        let result = match self.send_line(&line).await {
            Ok(()) => self.read_response(id).await,
            Err(e) => Err(e),
        };
        if let Err(failure) = &result {
            if failure.breaks_connection() {
                self.state = ConnectionState::Failed;
            }
        }
        result
    }

    async fn notify(&mut self, method: &str) -> std::result::Result<(), RpcFailure> {
        let line = serde_json::to_string(&JsonRpcNotification {
            jsonrpc: "2.0",
            method,
        })
        .map_err(|e| RpcFailure::Protocol(format!("serialize: {}", e)))?;
        debug!(backend = %self.name, method, "MCP → notification");
        let result = self.send_line(&line).await;
        if result.is_err() {
            self.state = ConnectionState::Failed;
        }
        result
    }

    async fn send_line(&mut self, line: &str) -> std::result::Result<(), RpcFailure> {
        let pipes = self.pipes.as_mut().ok_or(RpcFailure::Closed)?;
        write_line(&mut pipes.stdin, line).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                RpcFailure::Closed
            } else {
                RpcFailure::Io(e.to_string())
            }
        })
    }

    /// Read until the response to `id`. Server notifications in between are skipped.
    async fn read_response(&mut self, id: u64) -> std::result::Result<Value, RpcFailure> {
        let limit = self.response_timeout;
        let name = self.name.clone();
        let pipes = self.pipes.as_mut().ok_or(RpcFailure::Closed)?;

        loop {
            let mut line = String::new();
            let read = match limit {
                Some(limit) => tokio::time::timeout(limit, pipes.stdout.read_line(&mut line))
                    .await
                    .map_err(|_| RpcFailure::Io(format!("no response within {:?}", limit)))?,
                None => pipes.stdout.read_line(&mut line).await,
            };
            let n = read.map_err(|e| RpcFailure::Io(e.to_string()))?;
            if n == 0 {
                return Err(RpcFailure::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(backend = %name, "MCP ← {}", crate::safe_truncate(trimmed, 200));

            let msg: JsonRpcMessage = serde_json::from_str(trimmed)
                .map_err(|e| RpcFailure::Protocol(format!("unparseable response: {}", e)))?;

            if msg.id.is_none() {
                if let Some(method) = &msg.method {
                    debug!(backend = %name, method = %method, "MCP notification skipped");
                    continue;
                }
            }
            if msg.id.as_ref().and_then(Value::as_u64) != Some(id) {
                return Err(RpcFailure::Protocol(format!(
                    "response id {:?} does not match request {}",
                    msg.id, id
                )));
            }
            if let Some(err) = msg.error {
                return Err(RpcFailure::Remote(format!(
                    "JSON-RPC error {}: {}",
                    err.code, err.message
                )));
            }
            return Ok(msg.result.unwrap_or(Value::Null));
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Turn a `tools/call` result object into an outcome.
///
/// MCP returns `{ content: [{type, text}], isError?, structuredContent? }`.
pub(crate) fn parse_call_result(result: &Value) -> CallOutcome {
    let first_text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .find(|text| !text.is_empty())
        });

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let msg = first_text.unwrap_or("tool reported an error");
        return CallOutcome::Failed(CallError::Tool(msg.to_string()));
    }

    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return CallOutcome::Payload(ToolPayload::Structured(structured.clone()));
    }

    match first_text {
        Some(text) => CallOutcome::Payload(ToolPayload::from_text(text)),
        None => CallOutcome::NoResult,
    }
}
