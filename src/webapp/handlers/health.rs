use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::x402::VerificationMode;

use super::super::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: Vec<String>,
    pub service_uptime_secs: u64,
    pub direct_connections: usize,
    pub proxy_sessions: usize,
    /// Work proofs not yet settled or failed
    pub queued_work_proofs: usize,
    pub catalogued_tools: usize,
    pub payment_verification: VerificationMode,
    pub ledger: String,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: [env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string()].to_vec(),
        service_uptime_secs: state.started_at.elapsed().as_secs(),
        direct_connections: state.registry.direct_count(),
        proxy_sessions: state.registry.session_count(),
        queued_work_proofs: state.recorder.pending_count().await,
        catalogued_tools: state.gateway.catalog().len(),
        payment_verification: state.gateway.verifier_mode(),
        ledger: state.recorder.ledger_description(),
    })
}
