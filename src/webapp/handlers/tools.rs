use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::GatewayError;
use crate::identity::CallerIdentity;
use crate::x402::{InvokeOutcome, InvokeRequest};

use super::super::models::{
    CatalogResponse, ErrorResponse, InvokeToolRequest, InvokeToolResponse, PaymentRequiredResponse, ToolsResponse,
};
use super::super::AppState;

/// Header carrying the caller id when the body does not
pub const CALLER_ID_HEADER: &str = "x-caller-id";

#[utoipa::path(
    get,
    path = "/connections/{connection_id}/tools",
    tag = "Tools",
    params(("connection_id" = String, Path, description = "Direct id or proxy_<configId>")),
    responses(
        (status = 200, description = "Tools (possibly empty)", body = ToolsResponse),
        (status = 404, description = "Unknown connection", body = ErrorResponse),
        (status = 502, description = "Remote failed", body = ErrorResponse)
    )
)]
pub async fn list_tools_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<ToolsResponse>, GatewayError> {
    let outcome = state.router.list_tools(&connection_id).await?;
    Ok(Json(ToolsResponse {
        success: true,
        tools: outcome.items,
        message: outcome.message,
    }))
}

/// Invocable tools with their pricing
#[utoipa::path(
    get,
    path = "/tools/catalog",
    tag = "Tools",
    responses(
        (status = 200, description = "Pricing catalog", body = CatalogResponse)
    )
)]
pub async fn catalog_handler(State(state): State<AppState>) -> Json<CatalogResponse> {
    Json(CatalogResponse {
        success: true,
        tools: state.gateway.catalog().tools().to_vec(),
    })
}

fn caller_from(body: Option<&str>, headers: &HeaderMap) -> CallerIdentity {
    body.or_else(|| headers.get(CALLER_ID_HEADER).and_then(|v| v.to_str().ok()))
        .map(CallerIdentity::new)
        .unwrap_or_else(CallerIdentity::anonymous)
}

/// Invoke a catalogued tool
///
/// Priced tools without `paymentInfo` answer 402 with the amount to pay.
/// Settlement of the resulting work proof happens in the background; its
/// progress is visible at `/work-proofs/{taskId}`.
#[utoipa::path(
    post,
    path = "/tools/invoke",
    tag = "Tools",
    request_body = InvokeToolRequest,
    responses(
        (status = 200, description = "Tool executed", body = InvokeToolResponse),
        (status = 402, description = "Payment required", body = PaymentRequiredResponse),
        (status = 402, description = "Payment proof rejected", body = ErrorResponse),
        (status = 404, description = "Serving connection unavailable", body = ErrorResponse),
        (status = 422, description = "Tool not in the pricing catalog", body = ErrorResponse),
        (status = 502, description = "Tool execution failed", body = ErrorResponse)
    )
)]
pub async fn invoke_tool_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InvokeToolRequest>,
) -> Result<Response, GatewayError> {
    let caller = caller_from(req.caller_id.as_deref(), &headers);
    let outcome = state
        .gateway
        .invoke(InvokeRequest {
            tool_name: req.tool_name,
            input: req.input,
            payment_info: req.payment_info,
            caller,
        })
        .await?;

    Ok(match outcome {
        InvokeOutcome::PaymentRequired(challenge) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(PaymentRequiredResponse {
                success: false,
                payment_required: challenge,
            }),
        )
            .into_response(),
        InvokeOutcome::Executed(receipt) => (
            StatusCode::OK,
            Json(InvokeToolResponse {
                success: true,
                task_id: receipt.task_id,
                output: receipt.output,
                work_proof: receipt.work_proof,
                caller: receipt.caller,
                settlement: receipt.settlement,
            }),
        )
            .into_response(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_from(None, &headers), CallerIdentity::anonymous());

        headers.insert(CALLER_ID_HEADER, "bob".parse().unwrap());
        assert_eq!(caller_from(None, &headers).raw_id, "bob");
        assert_eq!(caller_from(Some("alice"), &headers).raw_id, "alice");
    }
}
