use axum::{extract::State, Json};

use crate::error::GatewayError;
use crate::mcp::is_proxy_connection;

use super::super::models::{
    AvailableConnectionsResponse, ConnectResponse, ConnectionIdRequest, ConnectionsResponse, DisconnectResponse,
    ErrorResponse,
};
use super::super::AppState;

/// List active connections
///
/// Direct connections by id, plus `proxy_<configId>` for every config that has
/// at least one live proxy stream.
#[utoipa::path(
    get,
    path = "/connections",
    tag = "Connections",
    responses(
        (status = 200, description = "Active connection ids", body = ConnectionsResponse)
    )
)]
pub async fn list_connections_handler(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        success: true,
        connections: state.registry.list_connection_ids(),
    })
}

/// Disconnect a connection
///
/// Proxy connections are only acknowledged: the remote's stream owns their
/// lifetime and tears the session down when it closes.
#[utoipa::path(
    post,
    path = "/connections/disconnect",
    tag = "Connections",
    request_body = ConnectionIdRequest,
    responses(
        (status = 200, description = "Disconnected, already gone, or acknowledged", body = DisconnectResponse)
    )
)]
pub async fn disconnect_handler(
    State(state): State<AppState>,
    Json(req): Json<ConnectionIdRequest>,
) -> Json<DisconnectResponse> {
    let id = req.connection_id;
    if is_proxy_connection(&id) {
        state.registry.disconnect_direct(&id).await;
        return Json(DisconnectResponse {
            success: true,
            connection_id: id,
            message: Some("Proxy sessions close when the remote stream ends".to_string()),
        });
    }

    // Unknown ids are a no-op
    let message = if state.registry.disconnect_direct(&id).await {
        tracing::info!(connection_id = %id, "Connection closed on request");
        None
    } else {
        tracing::debug!(connection_id = %id, "Disconnect for unknown connection");
        Some("No such connection; nothing to close".to_string())
    };
    Json(DisconnectResponse {
        success: true,
        connection_id: id,
        message,
    })
}

/// Configured connection records and whether each is live
#[utoipa::path(
    get,
    path = "/connections/available",
    tag = "Connections",
    responses(
        (status = 200, description = "Known connection records", body = AvailableConnectionsResponse)
    )
)]
pub async fn available_connections_handler(State(state): State<AppState>) -> Json<AvailableConnectionsResponse> {
    Json(AvailableConnectionsResponse {
        success: true,
        connections: state.source.availability(&state.registry),
    })
}

/// (Re)connect a configured direct record on demand
#[utoipa::path(
    post,
    path = "/connections/connect",
    tag = "Connections",
    request_body = ConnectionIdRequest,
    responses(
        (status = 200, description = "Connected, or proxy record acknowledged", body = ConnectResponse),
        (status = 404, description = "No such record", body = ErrorResponse),
        (status = 502, description = "Remote could not be initialized", body = ErrorResponse)
    )
)]
pub async fn connect_handler(
    State(state): State<AppState>,
    Json(req): Json<ConnectionIdRequest>,
) -> Result<Json<ConnectResponse>, GatewayError> {
    let record = state
        .source
        .get(&req.connection_id)
        .ok_or_else(|| GatewayError::ConnectionNotFound(req.connection_id.clone()))?;

    let connected = state
        .source
        .connect(&state.registry, record, state.upstream_timeout)
        .await
        .map_err(|e| GatewayError::UpstreamFailure(format!("{:#}", e)))?;

    Ok(Json(ConnectResponse {
        success: true,
        connection_id: record.connection_id(),
        connected,
        message: (!connected).then(|| "Proxy records connect when the remote opens its stream".to_string()),
    }))
}
