//! Gateway error taxonomy and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::mcp::McpError;
use crate::webapp::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Remote signalled an optional method it does not implement.
    /// Absorbed by the router; never reaches an HTTP response.
    #[error("Remote does not support {0}")]
    UnsupportedCapability(String),

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("Tool '{0}' is not present in the pricing catalog")]
    UnknownTool(String),

    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailure(String),

    #[error("Ledger submission failed: {0}")]
    LedgerSubmissionFailure(String),

    #[error("Unknown task: {0}")]
    TaskNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            GatewayError::UnsupportedCapability(_) => "UNSUPPORTED_CAPABILITY",
            GatewayError::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            GatewayError::UnknownTool(_) => "TOOL_NOT_PRICED",
            GatewayError::PaymentRejected(_) => "PAYMENT_REJECTED",
            GatewayError::ToolExecutionFailure(_) => "TOOL_EXECUTION_FAILED",
            GatewayError::LedgerSubmissionFailure(_) => "LEDGER_SUBMISSION_FAILED",
            GatewayError::TaskNotFound(_) => "TASK_NOT_FOUND",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Timeout(_) => "TIMEOUT",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ConnectionNotFound(_) | GatewayError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownTool(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UnsupportedCapability(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::UpstreamFailure(_)
            | GatewayError::ToolExecutionFailure(_)
            | GatewayError::LedgerSubmissionFailure(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<McpError> for GatewayError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Timeout(what) => GatewayError::Timeout(what),
            McpError::Rpc(e) if e.is_soft() => GatewayError::UnsupportedCapability(e.message),
            McpError::Rpc(e) => GatewayError::UpstreamFailure(e.message),
            other => GatewayError::UpstreamFailure(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), "{}", self);
        } else {
            tracing::debug!(code = self.code(), "{}", self);
        }

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::JsonRpcError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::ConnectionNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::UnknownTool("t".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            GatewayError::Timeout("tools/call".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_ledger_failure_distinct_from_tool_failure() {
        let ledger = GatewayError::LedgerSubmissionFailure("reverted".into());
        let tool = GatewayError::ToolExecutionFailure("crashed".into());
        assert_eq!(ledger.status(), tool.status());
        assert_ne!(ledger.code(), tool.code());
        assert_eq!(ledger.code(), "LEDGER_SUBMISSION_FAILED");
    }

    #[test]
    fn test_mcp_error_conversion() {
        let soft: GatewayError = McpError::Rpc(JsonRpcError::method_not_found("resources/list")).into();
        assert!(matches!(soft, GatewayError::UnsupportedCapability(_)));

        let hard: GatewayError = McpError::Rpc(JsonRpcError::internal("db down")).into();
        match hard {
            GatewayError::UpstreamFailure(msg) => assert_eq!(msg, "db down"),
            other => panic!("unexpected {:?}", other),
        }

        let transport: GatewayError = McpError::Transport("refused".into()).into();
        assert!(matches!(transport, GatewayError::UpstreamFailure(_)));
    }
}
