//! Read-path router: list resources/tools and read a resource on any connection

use serde_json::Value;

use super::mcp_client::McpError;
use super::protocol::ToolInfo;
use super::registry::ConnectionRegistry;
use crate::error::GatewayError;

/// Result of a list call; `message` is set when the remote lacks the capability
#[derive(Debug, Clone)]
pub struct ListOutcome<T> {
    pub items: Vec<T>,
    pub message: Option<String>,
}

impl<T> ListOutcome<T> {
    fn full(items: Vec<T>) -> Self {
        Self { items, message: None }
    }

    fn unsupported(method: &str) -> Self {
        Self {
            items: Vec::new(),
            message: Some(format!("Remote does not support {}", method)),
        }
    }
}

#[derive(Clone)]
pub struct ProtocolRouter {
    registry: ConnectionRegistry,
}

impl ProtocolRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub async fn list_resources(&self, connection_id: &str) -> Result<ListOutcome<Value>, GatewayError> {
        let handle = self.registry.get_client(connection_id)?;
        let result = handle.client.list_resources().await;
        absorb_soft(connection_id, "resources/list", result)
    }

    pub async fn list_tools(&self, connection_id: &str) -> Result<ListOutcome<ToolInfo>, GatewayError> {
        let handle = self.registry.get_client(connection_id)?;
        let result = handle.client.list_tools().await;
        absorb_soft(connection_id, "tools/list", result)
    }

    /// Reading is not optional: an unsupported-method reply is an upstream failure here
    pub async fn read_resource(&self, connection_id: &str, uri: &str) -> Result<Value, GatewayError> {
        if uri.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("uri must not be empty".to_string()));
        }
        let handle = self.registry.get_client(connection_id)?;
        handle.client.read_resource(uri).await.map_err(|e| match e {
            McpError::Rpc(rpc) => GatewayError::UpstreamFailure(rpc.message),
            other => other.into(),
        })
    }
}

fn absorb_soft<T>(
    connection_id: &str,
    method: &str,
    result: Result<Vec<T>, McpError>,
) -> Result<ListOutcome<T>, GatewayError> {
    match result {
        Ok(items) => Ok(ListOutcome::full(items)),
        Err(e) if e.is_soft() => {
            tracing::debug!(connection_id, method, "Optional capability not offered by remote");
            Ok(ListOutcome::unsupported(method))
        }
        Err(e) => {
            tracing::warn!(connection_id, method, error = %e, "Upstream call failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::mcp_client::ProtocolClient;
    use crate::mcp::protocol::JsonRpcError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Remote double answering per-method from a fixed table
    struct ScriptedClient {
        answer: fn(&str) -> Result<Value, McpError>,
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
            (self.answer)(method)
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn tools_only(method: &str) -> Result<Value, McpError> {
        match method {
            "tools/list" => Ok(json!({"tools": [{"name": "search", "inputSchema": {}}]})),
            other => Err(McpError::Rpc(JsonRpcError::method_not_found(other))),
        }
    }

    fn broken(_method: &str) -> Result<Value, McpError> {
        Err(McpError::Rpc(JsonRpcError::internal("database unavailable")))
    }

    fn router_with(answer: fn(&str) -> Result<Value, McpError>) -> ProtocolRouter {
        let registry = ConnectionRegistry::new();
        registry.register_direct("conn1", Arc::new(ScriptedClient { answer }));
        ProtocolRouter::new(registry)
    }

    #[tokio::test]
    async fn test_unsupported_list_is_empty_success() {
        let router = router_with(tools_only);
        let outcome = router.list_resources("conn1").await.unwrap();
        assert!(outcome.items.is_empty());
        assert!(outcome.message.unwrap().contains("resources/list"));
    }

    #[tokio::test]
    async fn test_supported_list_passes_through() {
        let router = router_with(tools_only);
        let outcome = router.list_tools("conn1").await.unwrap();
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].name, "search");
        assert!(outcome.message.is_none());
    }

    #[tokio::test]
    async fn test_hard_error_carries_remote_message() {
        let router = router_with(broken);
        match router.list_tools("conn1").await {
            Err(GatewayError::UpstreamFailure(msg)) => assert_eq!(msg, "database unavailable"),
            other => panic!("unexpected {:?}", other.map(|o| o.items.len())),
        }
    }

    #[tokio::test]
    async fn test_unknown_connection_propagates() {
        let router = router_with(tools_only);
        assert!(matches!(
            router.list_resources("missing").await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            router.read_resource("missing", "file:///a").await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_resource_unsupported_is_failure() {
        let router = router_with(tools_only);
        assert!(matches!(
            router.read_resource("conn1", "file:///a").await,
            Err(GatewayError::UpstreamFailure(_))
        ));
        assert!(matches!(
            router.read_resource("conn1", " ").await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
