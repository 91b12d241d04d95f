//! MCP client for connecting to upstream MCP servers
//!
//! [`ProtocolClient`] is the seam every connection kind implements. [`McpClient`]
//! is the direct implementation, speaking either Streamable HTTP or a spawned
//! stdio subprocess.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell};

use super::protocol::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolInfo};

/// MCP protocol revision advertised during `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Default bound on a single remote call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive HTTP transport failures after which a client is considered dead
pub const MAX_HTTP_TRANSPORT_FAILURES: u32 = 3;

// ============================================================================
// Error Types
// ============================================================================

/// MCP client error
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Transport-level error (network, IO, closed stream, ...)
    #[error("Transport error: {0}")]
    Transport(String),
    /// JSON-RPC error from server
    #[error("RPC error ({}): {}", .0.code, .0.message)]
    Rpc(JsonRpcError),
    /// No response within the call bound
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Whether the remote reported an optional method it does not implement
    pub fn is_soft(&self) -> bool {
        matches!(self, McpError::Rpc(e) if e.is_soft())
    }
}

// ============================================================================
// ProtocolClient
// ============================================================================

/// A live handle able to issue MCP calls to a remote provider
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send a request and wait for its result
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Whether the underlying transport can still carry calls
    fn is_live(&self) -> bool {
        true
    }

    /// Tear down the transport
    async fn close(&self) {}

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let result = self.request("tools/list", None).await?;

        #[derive(Deserialize)]
        struct ToolsListResult {
            #[serde(default)]
            tools: Vec<ToolInfo>,
        }

        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Internal(format!("Failed to parse tools/list result: {}", e)))?;
        Ok(list.tools)
    }

    /// Resources are passed through untyped; providers attach arbitrary metadata
    async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        let result = self.request("resources/list", None).await?;
        match result.get("resources") {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(McpError::Internal(format!(
                "resources/list returned a non-array: {}",
                other
            ))),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.request("resources/read", Some(json!({ "uri": uri }))).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let params = json!({
            "name": name,
            "arguments": if arguments.is_null() { json!({}) } else { arguments },
        });
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Internal(format!("Failed to parse result: {}", e)))
    }
}

// ============================================================================
// Transport Types
// ============================================================================

/// MCP transport configuration
#[derive(Debug, Clone)]
pub enum McpTransport {
    /// HTTP transport (Streamable HTTP)
    Http { url: String },
    /// Stdio transport (spawned subprocess)
    Stdio { command: String, args: Vec<String> },
}

impl McpTransport {
    /// Parse transport from a server string
    ///
    /// Formats:
    /// - `http://...` or `https://...` - HTTP transport
    /// - `stdio:command arg1 arg2` - Stdio transport
    pub fn parse(server: &str) -> Result<Self> {
        if let Some(cmd_str) = server.strip_prefix("stdio:") {
            let parts: Vec<&str> = cmd_str.split_whitespace().collect();
            let Some((command, args)) = parts.split_first() else {
                anyhow::bail!("Empty stdio command");
            };
            Ok(McpTransport::Stdio {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            })
        } else if server.starts_with("http://") || server.starts_with("https://") {
            url::Url::parse(server)
                .map_err(|e| anyhow::anyhow!("Invalid MCP server URL '{}': {}", server, e))?;
            Ok(McpTransport::Http { url: server.to_string() })
        } else {
            anyhow::bail!("Invalid MCP server URL: {}. Must start with http://, https://, or stdio:", server);
        }
    }
}

impl std::fmt::Display for McpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpTransport::Http { url } => write!(f, "{}", url),
            McpTransport::Stdio { command, args } => write!(f, "stdio:{} {}", command, args.join(" ")),
        }
    }
}

// ============================================================================
// MCP Client
// ============================================================================

/// Direct MCP client for an upstream server
pub struct McpClient {
    transport: McpTransport,
    request_id: AtomicU64,
    http_client: reqwest::Client,
    /// Session id handed out by Streamable-HTTP servers
    http_session: Mutex<Option<String>>,
    stdio_state: Mutex<Option<StdioState>>,
    initialized: OnceCell<Value>,
    timeout: Duration,
    /// Set once the transport is gone for good; never cleared
    dead: AtomicBool,
    http_failures: AtomicU32,
}

/// State for stdio transport connection
struct StdioState {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

impl McpClient {
    pub fn new(transport: McpTransport) -> Self {
        Self::with_timeout(transport, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(transport: McpTransport, timeout: Duration) -> Self {
        Self {
            transport,
            request_id: AtomicU64::new(1),
            http_client: reqwest::Client::new(),
            http_session: Mutex::new(None),
            stdio_state: Mutex::new(None),
            initialized: OnceCell::new(),
            timeout,
            dead: AtomicBool::new(false),
            http_failures: AtomicU32::new(0),
        }
    }

    pub fn transport(&self) -> &McpTransport {
        &self.transport
    }

    fn log(&self, msg: &str) {
        tracing::debug!(target: "mcp-client", "{}", msg);
    }

    fn mark_dead(&self, reason: &str) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            tracing::warn!(target: "mcp-client", reason, "MCP transport lost");
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run the initialize handshake once; later calls return the cached result
    pub async fn initialize(&self) -> Result<&Value, McpError> {
        self.initialized
            .get_or_try_init(|| async {
                let params = json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp402",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                });
                let result = self.call_method("initialize", Some(params)).await?;
                self.send_notification("notifications/initialized", None).await?;
                Ok::<Value, McpError>(result)
            })
            .await
    }

    async fn call_method(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let call = async {
            match &self.transport {
                McpTransport::Http { url } => self.call_http(url, method, params).await,
                McpTransport::Stdio { .. } => self.call_stdio(method, params).await,
            }
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| McpError::Timeout(method.to_string()))?
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let note = JsonRpcRequest::notification(method, params);
        self.log(&format!("-> {} (notification)", method));
        let send = async {
            match &self.transport {
                McpTransport::Http { url } => self.post_http(url, &note).await.map(|_| ()),
                McpTransport::Stdio { .. } => {
                    self.ensure_stdio_connected().await?;
                    let mut state = self.stdio_state.lock().await;
                    let state = state
                        .as_mut()
                        .ok_or_else(|| McpError::Transport("Not connected".to_string()))?;
                    write_line(&mut state.stdin, &note).await
                }
            }
        };
        tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| McpError::Timeout(method.to_string()))?
    }

    // ========================================================================
    // HTTP Transport
    // ========================================================================

    async fn post_http(&self, url: &str, body: &JsonRpcRequest) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);

        if let Some(session) = self.http_session.lock().await.as_ref() {
            req = req.header("Mcp-Session-Id", session);
        }

        let response = match req.send().await {
            Ok(response) => {
                self.http_failures.store(0, Ordering::SeqCst);
                response
            }
            Err(e) => {
                let failures = self.http_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= MAX_HTTP_TRANSPORT_FAILURES {
                    self.mark_dead("HTTP upstream unreachable");
                }
                return Err(McpError::Transport(format!("HTTP request failed: {}", e)));
            }
        };

        if let Some(session) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.http_session.lock().await = Some(session.to_string());
        }

        Ok(response)
    }

    async fn call_http(&self, url: &str, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);

        self.log(&format!("-> {} (id={})", method, id));

        let response = self.post_http(url, &request).await?;
        let status = response.status();
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to read response: {}", e)))?;

        self.log(&format!("<- {} ({} bytes)", status, body.len()));

        let rpc_response = if is_sse {
            find_sse_response(&body, id)?
        } else {
            if !status.is_success() && body.trim().is_empty() {
                return Err(McpError::Transport(format!("HTTP {}", status)));
            }
            serde_json::from_str(&body)
                .map_err(|e| McpError::Transport(format!("Invalid JSON-RPC response: {}", e)))?
        };

        into_result(rpc_response)
    }

    // ========================================================================
    // Stdio Transport
    // ========================================================================

    async fn ensure_stdio_connected(&self) -> Result<(), McpError> {
        let mut state = self.stdio_state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        if self.dead.load(Ordering::SeqCst) {
            return Err(McpError::Transport("Server process has exited".to_string()));
        }

        let McpTransport::Stdio { command, args } = &self.transport else {
            return Err(McpError::Internal("Not a stdio transport".to_string()));
        };

        self.log(&format!("Spawning: {} {}", command, args.join(" ")));

        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("Failed to spawn process: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to get stdout".to_string()))?;

        *state = Some(StdioState {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });

        Ok(())
    }

    async fn call_stdio(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_stdio_connected().await?;

        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let expected = JsonRpcId::Number(id as i64);

        self.log(&format!("-> {} (id={})", method, id));

        let mut guard = self.stdio_state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("Not connected".to_string()))?;

        if let Err(e) = write_line(&mut state.stdin, &request).await {
            *guard = None;
            self.mark_dead("stdin closed");
            return Err(e);
        }

        // Servers may interleave notifications; skip until our id comes back
        loop {
            let mut line = String::new();
            let n = match state.stdout.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    *guard = None;
                    self.mark_dead("stdout read failed");
                    return Err(McpError::Transport(format!("Read failed: {}", e)));
                }
            };
            if n == 0 {
                *guard = None;
                self.mark_dead("stdout closed");
                return Err(McpError::Transport("Server closed stdout".to_string()));
            }

            self.log(&format!("<- {} bytes", line.len()));

            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                continue;
            };
            if response.id.as_ref() == Some(&expected) {
                return into_result(response);
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for McpClient {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if method != "initialize" {
            self.initialize().await?;
        }
        self.call_method(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.send_notification(method, params).await
    }

    fn is_live(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let mut state = self.stdio_state.lock().await;
        if let Some(mut s) = state.take() {
            let _ = s.child.kill().await;
        }
    }
}

async fn write_line(stdin: &mut tokio::process::ChildStdin, msg: &JsonRpcRequest) -> Result<(), McpError> {
    let line = serde_json::to_string(msg)
        .map_err(|e| McpError::Internal(format!("Failed to serialize request: {}", e)))?;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| McpError::Transport(format!("Write failed: {}", e)))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|e| McpError::Transport(format!("Write failed: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| McpError::Transport(format!("Flush failed: {}", e)))
}

fn into_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc(error));
    }
    response
        .result
        .ok_or_else(|| McpError::Transport("Response has neither result nor error".to_string()))
}

/// Pick the response with `id` out of an SSE-framed HTTP body
fn find_sse_response(body: &str, id: u64) -> Result<JsonRpcResponse, McpError> {
    let expected = JsonRpcId::Number(id as i64);
    body.split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(|l| l.trim_start())
                .collect();
            if data.is_empty() {
                None
            } else {
                serde_json::from_str::<JsonRpcResponse>(&data.join("\n")).ok()
            }
        })
        .find(|r| r.id.as_ref() == Some(&expected))
        .ok_or_else(|| McpError::Transport(format!("No response for id {} in event stream", id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_transport() {
        let transport = McpTransport::parse("https://mcp.example.com/v1").unwrap();
        assert!(matches!(transport, McpTransport::Http { url } if url == "https://mcp.example.com/v1"));
    }

    #[test]
    fn test_parse_stdio_transport() {
        let transport = McpTransport::parse("stdio:npx mcp-server --port 3000").unwrap();
        match transport {
            McpTransport::Stdio { command, args } => {
                assert_eq!(command, "npx");
                assert_eq!(args, vec!["mcp-server", "--port", "3000"]);
            }
            _ => panic!("Expected stdio transport"),
        }
    }

    #[test]
    fn test_parse_invalid_transport() {
        assert!(McpTransport::parse("ftp://invalid.com").is_err());
        assert!(McpTransport::parse("stdio:   ").is_err());
    }

    #[test]
    fn test_find_sse_response_skips_other_events() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\n";
        let resp = find_sse_response(body, 3).unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert!(find_sse_response(body, 4).is_err());
    }

    #[test]
    fn test_into_result_surfaces_rpc_error() {
        let resp = JsonRpcResponse::error(
            Some(JsonRpcId::Number(1)),
            JsonRpcError::method_not_found("resources/list"),
        );
        let err = into_result(resp).unwrap_err();
        assert!(err.is_soft());
    }

    #[tokio::test]
    async fn test_http_call_times_out_on_unreachable_host() {
        // 203.0.113.0/24 is TEST-NET-3; connections hang or fail, never answer
        let client = McpClient::with_timeout(
            McpTransport::Http { url: "http://203.0.113.1:9/mcp".to_string() },
            Duration::from_millis(200),
        );
        let err = client.call_method("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(_) | McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_http_upstream_goes_dead() {
        use crate::mcp::ConnectionRegistry;
        use std::sync::Arc;

        // Nothing listens on port 1; every send is refused
        let client = Arc::new(McpClient::with_timeout(
            McpTransport::Http { url: "http://127.0.0.1:1/mcp".to_string() },
            Duration::from_secs(5),
        ));
        let registry = ConnectionRegistry::new();
        registry.register_direct("conn1", client.clone());

        for _ in 0..MAX_HTTP_TRANSPORT_FAILURES {
            assert!(client.is_live());
            let err = client.call_method("tools/list", None).await.unwrap_err();
            assert!(matches!(err, McpError::Transport(_)), "{err}");
        }

        assert!(!client.is_live());
        assert!(registry.get_client("conn1").is_err());
        assert!(!registry.has_direct("conn1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_stdio_server_is_not_respawned() {
        let marker = std::env::temp_dir().join(format!("mcp402-spawn-{}", uuid::Uuid::new_v4()));
        let client = McpClient::with_timeout(
            McpTransport::Stdio {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), format!("echo spawned >> '{}'", marker.display())],
            },
            Duration::from_secs(5),
        );

        assert!(client.is_live());
        assert!(client.request("tools/list", None).await.is_err());
        assert!(!client.is_live());
        assert!(client.request("tools/list", None).await.is_err());

        let spawns = std::fs::read_to_string(&marker).unwrap_or_default().lines().count();
        let _ = std::fs::remove_file(&marker);
        assert_eq!(spawns, 1);
    }

    #[tokio::test]
    async fn test_closed_client_reports_dead() {
        let client = McpClient::new(McpTransport::Http { url: "http://127.0.0.1:1/mcp".to_string() });
        assert!(client.is_live());
        client.close().await;
        assert!(!client.is_live());
    }
}
