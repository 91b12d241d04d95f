//! MCP (Model Context Protocol) connection layer
//!
//! - JSON-RPC message types and the soft error-code table
//! - Direct clients over Streamable HTTP or stdio
//! - Proxy sessions bridged over an inbound SSE stream
//! - The connection registry and the read-path router

pub mod protocol;
pub mod mcp_client;
pub mod session;
pub mod registry;
pub mod router;
pub mod sources;

pub use mcp_client::{McpClient, McpError, McpTransport, ProtocolClient};
pub use registry::{is_proxy_connection, ConnectionHandle, ConnectionKind, ConnectionRegistry, PROXY_PREFIX};
pub use router::{ListOutcome, ProtocolRouter};
pub use session::{BridgeClient, ProxySession, SessionGuard};
pub use sources::{ConnectionRecord, ConnectionSource, ConnectionType};
