use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::GatewayError;
use crate::eth::parse_address;
use crate::identity::CallerIdentity;

use super::super::models::{ErrorResponse, IdentityResponse, WorkProofStatusResponse, WorkloadResponse};
use super::super::AppState;

/// Settlement status of one work proof
#[utoipa::path(
    get,
    path = "/work-proofs/{task_id}",
    tag = "Work proofs",
    params(("task_id" = String, Path, description = "Task id returned by /tools/invoke")),
    responses(
        (status = 200, description = "Settlement status", body = WorkProofStatusResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse)
    )
)]
pub async fn work_proof_status_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<WorkProofStatusResponse>, GatewayError> {
    let settlement = state
        .recorder
        .status(&task_id)
        .await
        .ok_or_else(|| GatewayError::TaskNotFound(task_id.clone()))?;
    Ok(Json(WorkProofStatusResponse {
        success: true,
        task_id,
        settlement,
    }))
}

/// Workload for a caller
///
/// EVM addresses are also looked up on the ledger contract; any other id gets
/// the local tally under its canonical key only.
#[utoipa::path(
    get,
    path = "/workload/{user}",
    tag = "Callers",
    params(("user" = String, Path, description = "EVM address or any caller id")),
    responses(
        (status = 200, description = "Workload", body = WorkloadResponse),
        (status = 502, description = "Ledger lookup failed", body = ErrorResponse)
    )
)]
pub async fn workload_handler(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<WorkloadResponse>, GatewayError> {
    let caller = CallerIdentity::new(user.as_str());
    let local = state.recorder.tally(&caller.canonical_uuid).await;

    let ledger = match parse_address(&user) {
        Some(address) => Some(
            state
                .recorder
                .user_workload(address)
                .await
                .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?,
        ),
        None => None,
    };

    Ok(Json(WorkloadResponse {
        success: true,
        caller,
        local,
        ledger,
    }))
}

/// Canonical key for a raw caller id
#[utoipa::path(
    get,
    path = "/identity/{raw}",
    tag = "Callers",
    params(("raw" = String, Path, description = "Wallet, email, handle, ...")),
    responses(
        (status = 200, description = "Canonical caller key", body = IdentityResponse)
    )
)]
pub async fn identity_handler(Path(raw): Path<String>) -> Json<IdentityResponse> {
    Json(IdentityResponse {
        success: true,
        caller: CallerIdentity::new(raw),
    })
}
