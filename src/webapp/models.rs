use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::identity::CallerIdentity;
use crate::ledger::{CallerTally, SettlementStatus, UserWorkload, WorkProof};
use crate::mcp::protocol::ToolInfo;
use crate::mcp::sources::AvailableConnection;
use crate::x402::{PaymentChallenge, PaymentProof, ToolPricingPolicy};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    pub error: String,
    #[schema(example = "CONNECTION_NOT_FOUND")]
    pub code: String,
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    pub success: bool,
    /// Direct ids plus `proxy_<configId>` for every config with a live stream
    pub connections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdRequest {
    #[schema(example = "conn1")]
    pub connection_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AvailableConnectionsResponse {
    pub success: bool,
    pub connections: Vec<AvailableConnection>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    pub connection_id: String,
    /// False for proxy records, which connect from the remote side
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Resources and tools
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResourcesResponse {
    pub success: bool,
    pub resources: Vec<Value>,
    /// Set when the remote does not implement resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ToolsResponse {
    pub success: bool,
    pub tools: Vec<ToolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceRequest {
    pub connection_id: String,
    #[schema(example = "file:///README.md")]
    pub uri: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadResourceResponse {
    pub success: bool,
    pub result: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CatalogResponse {
    pub success: bool,
    pub tools: Vec<ToolPricingPolicy>,
}

// ============================================================================
// Invocation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeToolRequest {
    #[schema(example = "search")]
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub payment_info: Option<PaymentProof>,
    /// Wallet, email or handle; `x-caller-id` header is used when absent
    #[serde(default)]
    pub caller_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeToolResponse {
    pub success: bool,
    pub task_id: String,
    pub output: Value,
    pub work_proof: WorkProof,
    pub caller: CallerIdentity,
    pub settlement: SettlementStatus,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub success: bool,
    pub payment_required: PaymentChallenge,
}

// ============================================================================
// Proxy sessions
// ============================================================================

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInboxResponse {
    pub success: bool,
    pub session_id: String,
    /// Notifications and unmatched responses from the remote, oldest first
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<Value>,
}

// ============================================================================
// Work proofs and callers
// ============================================================================

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkProofStatusResponse {
    pub success: bool,
    pub task_id: String,
    pub settlement: SettlementStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IdentityResponse {
    pub success: bool,
    pub caller: CallerIdentity,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkloadResponse {
    pub success: bool,
    pub caller: CallerIdentity,
    /// Tasks recorded by this process
    pub local: CallerTally,
    /// On-chain totals; only for EVM addresses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<UserWorkload>,
}
