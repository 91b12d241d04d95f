//! Proxy sessions: MCP clients bridged over an inbound SSE stream
//!
//! A remote provider opens `GET /proxy/{configId}/sse` and keeps it open. Calls
//! we make to it are pushed down that stream as `message` events; the remote
//! answers by POSTing frames to `/proxy/messages?sessionId=...`.
//!
//! The stream is the only consumer of the outbound channel, so concurrent
//! callers serialize through the channel instead of racing on the stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, OnceCell};

use super::mcp_client::{McpError, ProtocolClient, DEFAULT_CALL_TIMEOUT, PROTOCOL_VERSION};
use super::protocol::{JsonRpcError, JsonRpcFrame, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
use super::registry::ConnectionRegistry;

/// Inbound frames kept per session before the oldest are dropped
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Outbound frames buffered ahead of the SSE writer
const OUTBOUND_BUFFER: usize = 64;

/// One bridged remote endpoint
pub struct ProxySession {
    pub session_id: String,
    pub config_id: String,
    pub client: Arc<BridgeClient>,
    pub created_at: u64,
}

impl ProxySession {
    /// Create a session and the receiving end of its outbound channel.
    ///
    /// The receiver must be owned by the SSE stream serving this session.
    pub fn open(config_id: impl Into<String>, timeout: Duration) -> (Arc<Self>, mpsc::Receiver<String>) {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let (client, outbound_rx) = BridgeClient::new(session_id.clone(), timeout);
        let session = Arc::new(Self {
            session_id,
            config_id: config_id.into(),
            client,
            created_at: crate::prelude::unix_millis(),
        });
        (session, outbound_rx)
    }

    /// Path the remote must POST its frames to
    pub fn message_endpoint(&self) -> String {
        format!("/proxy/messages?sessionId={}", self.session_id)
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("session_id", &self.session_id)
            .field("config_id", &self.config_id)
            .field("live", &self.client.is_live())
            .finish()
    }
}

/// Removes the session from the registry when the owning stream goes away
///
/// Held by the SSE stream; dropping the stream for any reason (client gone,
/// write error, server shutdown) drops the guard.
pub struct SessionGuard {
    registry: ConnectionRegistry,
    session_id: String,
}

impl SessionGuard {
    pub fn new(registry: ConnectionRegistry, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove_proxy_session(&self.session_id).is_some() {
            tracing::info!(session_id = %self.session_id, "Proxy stream closed, session removed");
        }
    }
}

// ============================================================================
// BridgeClient
// ============================================================================

type PendingMap = HashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>;

/// [`ProtocolClient`] that tunnels calls through a proxy session's stream
pub struct BridgeClient {
    session_id: String,
    outbound: mpsc::Sender<String>,
    pending: Mutex<PendingMap>,
    inbound: Mutex<VecDeque<Value>>,
    closed: AtomicBool,
    request_id: AtomicU64,
    initialized: OnceCell<Value>,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(session_id: String, timeout: Duration) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let client = Arc::new(Self {
            session_id,
            outbound,
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            request_id: AtomicU64::new(1),
            initialized: OnceCell::new(),
            timeout,
        });
        (client, rx)
    }

    pub fn with_default_timeout(session_id: String) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::new(session_id, DEFAULT_CALL_TIMEOUT)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inbound(&self) -> std::sync::MutexGuard<'_, VecDeque<Value>> {
        self.inbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a frame POSTed by the remote.
    ///
    /// A response whose id matches an in-flight request completes it. Requests
    /// from the remote are answered on the stream: `ping` with an empty result,
    /// anything else with method-not-found. Notifications and unmatched
    /// responses land in the inbound queue.
    pub async fn deliver(&self, frame: JsonRpcFrame) {
        match frame {
            JsonRpcFrame::Response(resp) => {
                let waiter = resp.id.as_ref().and_then(|id| self.pending().remove(id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        tracing::debug!(session_id = %self.session_id, id = ?resp.id, "Unmatched response queued");
                        self.push_inbound(json!(resp));
                    }
                }
            }
            JsonRpcFrame::Request(req) if req.is_notification() => {
                tracing::debug!(session_id = %self.session_id, method = %req.method, "Inbound notification queued");
                self.push_inbound(json!(req));
            }
            JsonRpcFrame::Request(req) => {
                let reply = answer_inbound(&req);
                tracing::debug!(session_id = %self.session_id, method = %req.method, "Answering inbound request");
                self.reply(&reply).await;
            }
        }
    }

    async fn reply(&self, response: &JsonRpcResponse) {
        let text = match serde_json::to_string(response) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to serialize reply");
                return;
            }
        };
        if self.outbound.send(text).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "Stream gone before reply could be sent");
        }
    }

    fn push_inbound(&self, frame: Value) {
        let mut queue = self.inbound();
        if queue.len() >= INBOUND_QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    /// Take everything currently in the inbound queue, oldest first
    pub fn drain_inbound(&self) -> Vec<Value> {
        self.inbound().drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Mark the bridge dead and fail every in-flight call
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes each waiter with a closed-channel error
        self.pending().clear();
    }

    async fn send_frame(&self, frame: &JsonRpcRequest) -> Result<(), McpError> {
        if !self.is_live() {
            return Err(McpError::Transport(format!("Proxy session {} is closed", self.session_id)));
        }
        let text = serde_json::to_string(frame)
            .map_err(|e| McpError::Internal(format!("Failed to serialize request: {}", e)))?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| McpError::Transport(format!("Proxy stream {} is gone", self.session_id)))
    }

    async fn roundtrip(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let key = JsonRpcId::Number(id as i64);

        let (tx, rx) = oneshot::channel();
        self.pending().insert(key.clone(), tx);

        tracing::debug!(target: "mcp-client", session_id = %self.session_id, "-> {} (id={})", method, id);

        if let Err(e) = self.send_frame(&request).await {
            self.pending().remove(&key);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(McpError::Transport(format!(
                    "Proxy session {} closed before responding",
                    self.session_id
                )))
            }
            Err(_) => {
                self.pending().remove(&key);
                return Err(McpError::Timeout(method.to_string()));
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::Rpc(error));
        }
        response
            .result
            .ok_or_else(|| McpError::Transport("Response has neither result nor error".to_string()))
    }

    async fn ensure_initialized(&self) -> Result<(), McpError> {
        self.initialized
            .get_or_try_init(|| async {
                let params = json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "mcp402", "version": env!("CARGO_PKG_VERSION") }
                });
                let result = self.roundtrip("initialize", Some(params)).await?;
                self.send_frame(&JsonRpcRequest::notification("notifications/initialized", None))
                    .await?;
                Ok::<Value, McpError>(result)
            })
            .await
            .map(|_| ())
    }
}

/// Reply to a request the remote side sent us
fn answer_inbound(req: &JsonRpcRequest) -> JsonRpcResponse {
    match req.method.as_str() {
        "ping" => JsonRpcResponse::success(req.id.clone(), json!({})),
        other => JsonRpcResponse::error(req.id.clone(), JsonRpcError::method_not_found(other)),
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if method != "initialize" {
            self.ensure_initialized().await?;
        }
        self.roundtrip(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.send_frame(&JsonRpcRequest::notification(method, params)).await
    }

    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    async fn close(&self) {
        self.shutdown();
    }
}
