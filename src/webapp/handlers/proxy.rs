//! Proxy session endpoints
//!
//! A remote MCP server that cannot be dialled opens `GET /proxy/{configId}/sse`.
//! Requests to it flow down that stream as `message` events; its replies come
//! back through `POST /proxy/messages?sessionId=...`. Notifications it sends
//! are held in the session's inbox until read with `GET` on the same path.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::IntoParams;

use crate::error::GatewayError;
use crate::mcp::protocol::JsonRpcFrame;
use crate::mcp::{ProxySession, SessionGuard};

use super::super::models::{ErrorResponse, ProxyInboxResponse};
use super::super::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Open a proxy stream for `config_id`
///
/// The first event is `endpoint`, carrying the path to POST replies to. The
/// session lives exactly as long as this stream.
#[utoipa::path(
    get,
    path = "/proxy/{config_id}/sse",
    tag = "Proxy",
    params(("config_id" = String, Path, description = "Connection record id")),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream")
    )
)]
pub async fn proxy_sse_handler(
    State(state): State<AppState>,
    Path(config_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session, outbound) = ProxySession::open(config_id, state.upstream_timeout);
    state.registry.register_proxy_session(session.clone());

    // Moved into the stream: dropping the stream removes the session
    let guard = SessionGuard::new(state.registry.clone(), session.session_id.clone());

    let endpoint = stream::once(futures::future::ready(Ok(
        Event::default().event("endpoint").data(session.message_endpoint()),
    )));
    let messages = ReceiverStream::new(outbound).map(move |frame| {
        let _ = &guard;
        Ok(Event::default().event("message").data(frame))
    });

    Sse::new(endpoint.chain(messages)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

/// Deliver a JSON-RPC frame from the remote side of a proxy session
#[utoipa::path(
    post,
    path = "/proxy/messages",
    tag = "Proxy",
    params(SessionQuery),
    request_body = Object,
    responses(
        (status = 202, description = "Frame accepted"),
        (status = 400, description = "Not a JSON-RPC frame", body = ErrorResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
pub async fn proxy_message_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    Json(body): Json<Value>,
) -> Result<StatusCode, GatewayError> {
    let session = state
        .registry
        .proxy_session(&query.session_id)
        .ok_or_else(|| GatewayError::ConnectionNotFound(format!("proxy session {}", query.session_id)))?;

    let frame: JsonRpcFrame =
        serde_json::from_value(body).map_err(|e| GatewayError::InvalidRequest(format!("Not a JSON-RPC frame: {}", e)))?;

    session.client.deliver(frame).await;
    Ok(StatusCode::ACCEPTED)
}

/// Read and clear the inbox of a proxy session
#[utoipa::path(
    get,
    path = "/proxy/messages",
    tag = "Proxy",
    params(SessionQuery),
    responses(
        (status = 200, description = "Queued frames, oldest first", body = ProxyInboxResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
pub async fn proxy_inbox_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ProxyInboxResponse>, GatewayError> {
    let session = state
        .registry
        .proxy_session(&query.session_id)
        .ok_or_else(|| GatewayError::ConnectionNotFound(format!("proxy session {}", query.session_id)))?;

    Ok(Json(ProxyInboxResponse {
        success: true,
        session_id: session.session_id.clone(),
        messages: session.client.drain_inbound(),
    }))
}
