//! Request tracing middleware
//!
//! Each request runs in its own root span `httpd{id}` so log lines from one
//! request (including remote MCP calls it triggers) can be correlated.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info_span, Instrument};

/// Short random hex correlation id
fn gen_id() -> String {
    format!("{:06x}", rand::random::<u32>() & 0xFFFFFF)
}

/// Root span per request; never nested under whatever span accepted the connection
pub async fn trace_request(request: Request, next: Next) -> Response {
    let id = gen_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!(parent: None, "httpd", %id);

    async move {
        let started = Instant::now();
        let response = next.run(request).await;
        tracing::debug!(
            %method,
            %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        response
    }
    .instrument(span)
    .await
}
