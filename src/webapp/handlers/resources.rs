use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::GatewayError;

use super::super::models::{ErrorResponse, ReadResourceRequest, ReadResourceResponse, ResourcesResponse};
use super::super::AppState;

/// List resources on a connection
///
/// A remote without resource support yields an empty list and a message, not an error.
#[utoipa::path(
    get,
    path = "/connections/{connection_id}/resources",
    tag = "Resources",
    params(("connection_id" = String, Path, description = "Direct id or proxy_<configId>")),
    responses(
        (status = 200, description = "Resources (possibly empty)", body = ResourcesResponse),
        (status = 404, description = "Unknown connection", body = ErrorResponse),
        (status = 502, description = "Remote failed", body = ErrorResponse)
    )
)]
pub async fn list_resources_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<ResourcesResponse>, GatewayError> {
    let outcome = state.router.list_resources(&connection_id).await?;
    Ok(Json(ResourcesResponse {
        success: true,
        resources: outcome.items,
        message: outcome.message,
    }))
}

#[utoipa::path(
    post,
    path = "/resources/read",
    tag = "Resources",
    request_body = ReadResourceRequest,
    responses(
        (status = 200, description = "Remote result, passed through", body = ReadResourceResponse),
        (status = 400, description = "Empty uri", body = ErrorResponse),
        (status = 404, description = "Unknown connection", body = ErrorResponse),
        (status = 502, description = "Remote failed", body = ErrorResponse)
    )
)]
pub async fn read_resource_handler(
    State(state): State<AppState>,
    Json(req): Json<ReadResourceRequest>,
) -> Result<Json<ReadResourceResponse>, GatewayError> {
    let result = state.router.read_resource(&req.connection_id, &req.uri).await?;
    Ok(Json(ReadResourceResponse { success: true, result }))
}
