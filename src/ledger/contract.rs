//! Work ledger contract access
//!
//! [`WorkLedger`] is the settlement seam. [`EvmWorkLedger`] talks to the
//! on-chain contract; [`MemoryLedger`] keeps everything in-process for local
//! runs without a chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use utoipa::ToSchema;

use super::proof::WorkProof;
use crate::eth::{Eip1559Tx, EthRpc, EvmSigner, RpcError, SignerError};

sol! {
    interface IWorkProofLedger {
        function submitWorkProof(
            string taskId,
            string toolName,
            uint256 inputSize,
            uint256 outputSize,
            uint256 executionTime,
            uint256 timestamp,
            bytes32 proofHash
        ) external;

        function getUserWorkload(address user)
            external
            view
            returns (uint256 totalTasks, uint256 totalTokensEarned, uint256 lastActivity);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Signing error: {0}")]
    Signer(#[from] SignerError),
    #[error("Transaction {0} reverted")]
    Reverted(B256),
    #[error("Transaction {tx_hash} not confirmed within {waited:?}")]
    ConfirmationTimeout { tx_hash: B256, waited: Duration },
    #[error("Chain id mismatch: configured {configured}, endpoint reports {reported}")]
    ChainMismatch { configured: u64, reported: u64 },
    #[error("Failed to decode contract response: {0}")]
    Decode(String),
}

/// Confirmation of one settled proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    #[schema(value_type = String)]
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Aggregate returned by `getUserWorkload`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserWorkload {
    #[schema(value_type = String)]
    pub total_tasks: U256,
    #[schema(value_type = String)]
    pub total_tokens_earned: U256,
    #[schema(value_type = String)]
    pub last_activity: U256,
}

#[async_trait]
pub trait WorkLedger: Send + Sync {
    /// Submit a proof and wait for it to be final
    async fn submit(&self, proof: &WorkProof) -> Result<LedgerReceipt, LedgerError>;

    async fn user_workload(&self, user: Address) -> Result<UserWorkload, LedgerError>;

    /// Short label for logs and `/health`
    fn describe(&self) -> String;
}

/// ABI calldata for `submitWorkProof`
pub fn encode_submit(proof: &WorkProof) -> Bytes {
    IWorkProofLedger::submitWorkProofCall {
        taskId: proof.task_id.clone(),
        toolName: proof.tool_name.clone(),
        inputSize: U256::from(proof.input_size),
        outputSize: U256::from(proof.output_size),
        executionTime: U256::from(proof.execution_time_ms),
        timestamp: U256::from(proof.timestamp_ms),
        proofHash: proof.proof_hash,
    }
    .abi_encode()
    .into()
}

// ============================================================================
// EvmWorkLedger
// ============================================================================

#[derive(Debug, Clone)]
pub struct EvmLedgerSettings {
    pub chain_id: u64,
    pub contract: Address,
    /// How long to wait for a receipt after broadcast
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
}

/// A signed submission already handed to the node for one task
#[derive(Debug, Clone)]
struct Broadcast {
    raw: Vec<u8>,
    tx_hash: B256,
    nonce: u64,
}

/// On-chain ledger reached over JSON-RPC, signing with a local key
///
/// Each task id owns at most one nonce. A retry first looks for the earlier
/// transaction and only resends the same signed bytes if the node has dropped
/// it, so at most one copy per task can ever be mined.
pub struct EvmWorkLedger {
    rpc: EthRpc,
    signer: Arc<EvmSigner>,
    settings: EvmLedgerSettings,
    /// Broadcasts awaiting a receipt, keyed by task id; the lock also serializes nonce allocation
    inflight: Mutex<HashMap<String, Broadcast>>,
}

impl EvmWorkLedger {
    pub fn new(rpc: EthRpc, signer: Arc<EvmSigner>, settings: EvmLedgerSettings) -> Self {
        Self {
            rpc,
            signer,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Check the endpoint serves the configured chain
    pub async fn check_chain(&self) -> Result<(), LedgerError> {
        let reported = self.rpc.chain_id().await?;
        if reported != self.settings.chain_id {
            return Err(LedgerError::ChainMismatch {
                configured: self.settings.chain_id,
                reported,
            });
        }
        Ok(())
    }

    /// Transaction hash carrying `proof`, broadcasting only if no earlier attempt is still live
    async fn broadcast_once(&self, proof: &WorkProof) -> Result<B256, LedgerError> {
        let mut inflight = self.inflight.lock().await;

        if let Some(prior) = inflight.get(&proof.task_id).cloned() {
            if self.rpc.transaction_receipt(prior.tx_hash).await?.is_some()
                || self.rpc.transaction_by_hash(prior.tx_hash).await?.is_some()
            {
                tracing::debug!(task_id = %proof.task_id, tx_hash = %prior.tx_hash, "Awaiting earlier broadcast");
                return Ok(prior.tx_hash);
            }

            tracing::info!(
                task_id = %proof.task_id,
                tx_hash = %prior.tx_hash,
                nonce = prior.nonce,
                "Earlier broadcast dropped by the node, resending"
            );
            return match self.rpc.send_raw_transaction(&prior.raw).await {
                Ok(_) => Ok(prior.tx_hash),
                Err(e) if is_already_known(&e) => Ok(prior.tx_hash),
                Err(e) => {
                    if is_rejection(&e) {
                        // The nonce was never consumed by this task; the next attempt starts over
                        inflight.remove(&proof.task_id);
                    }
                    Err(e.into())
                }
            };
        }

        let input = encode_submit(proof);
        let from = self.signer.address();

        let nonce = self.rpc.pending_nonce(from).await?;
        let base_fee = self.rpc.latest_base_fee().await?;
        let priority = match self.rpc.max_priority_fee().await {
            Ok(fee) => fee,
            Err(e) => {
                tracing::debug!(error = %e, "eth_maxPriorityFeePerGas unavailable, using 1 gwei");
                1_000_000_000
            }
        };
        let estimate = self.rpc.estimate_gas(from, self.settings.contract, &input).await?;

        let tx = Eip1559Tx {
            chain_id: self.settings.chain_id,
            nonce,
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(priority),
            gas_limit: estimate.saturating_add(estimate / 5),
            to: self.settings.contract,
            value: U256::ZERO,
            input,
        };

        let (raw, tx_hash) = tx.sign(self.signer.as_ref()).await?;

        // Recorded before sending: a cancelled or ambiguous send is looked up, not repeated
        inflight.insert(
            proof.task_id.clone(),
            Broadcast {
                raw: raw.clone(),
                tx_hash,
                nonce,
            },
        );

        match self.rpc.send_raw_transaction(&raw).await {
            Ok(reported) if reported != tx_hash => {
                tracing::warn!(local = %tx_hash, remote = %reported, "Node reported a different tx hash");
            }
            Ok(_) => {}
            Err(e) if is_already_known(&e) => {}
            Err(e) if is_rejection(&e) => {
                inflight.remove(&proof.task_id);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(task_id = %proof.task_id, %tx_hash, nonce, gas = tx.gas_limit, "Work proof broadcast");
        Ok(tx_hash)
    }

    /// Number of tasks with a broadcast still awaiting its receipt
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<LedgerReceipt, LedgerError> {
        let deadline = tokio::time::Instant::now() + self.settings.confirm_timeout;
        loop {
            if let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? {
                if receipt.status != 1 {
                    return Err(LedgerError::Reverted(tx_hash));
                }
                return Ok(LedgerReceipt {
                    tx_hash,
                    block_number: receipt.block_number,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::ConfirmationTimeout {
                    tx_hash,
                    waited: self.settings.confirm_timeout,
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl WorkLedger for EvmWorkLedger {
    async fn submit(&self, proof: &WorkProof) -> Result<LedgerReceipt, LedgerError> {
        let tx_hash = self.broadcast_once(proof).await?;
        let outcome = self.wait_for_receipt(tx_hash).await;
        if matches!(outcome, Ok(_) | Err(LedgerError::Reverted(_))) {
            // Mined either way: the nonce is spent and the record is done
            self.inflight.lock().await.remove(&proof.task_id);
        }
        outcome
    }

    async fn user_workload(&self, user: Address) -> Result<UserWorkload, LedgerError> {
        let data: Bytes = IWorkProofLedger::getUserWorkloadCall { user }.abi_encode().into();
        let output = self.rpc.eth_call(self.settings.contract, &data).await?;
        let ret = IWorkProofLedger::getUserWorkloadCall::abi_decode_returns(&output, true)
            .map_err(|e| LedgerError::Decode(e.to_string()))?;
        Ok(UserWorkload {
            total_tasks: ret.totalTasks,
            total_tokens_earned: ret.totalTokensEarned,
            last_activity: ret.lastActivity,
        })
    }

    fn describe(&self) -> String {
        format!("evm:{}@{}", self.settings.contract, self.settings.chain_id)
    }
}

/// The node answered and refused the transaction
fn is_rejection(e: &RpcError) -> bool {
    matches!(e, RpcError::Rpc { .. })
}

/// The node already holds this exact transaction
fn is_already_known(e: &RpcError) -> bool {
    match e {
        RpcError::Rpc { message, .. } => {
            let message = message.to_lowercase();
            message.contains("already known") || message.contains("known transaction")
        }
        _ => false,
    }
}

// ============================================================================
// MemoryLedger
// ============================================================================

/// In-process ledger; dedupes by task id like the contract does
#[derive(Default)]
pub struct MemoryLedger {
    proofs: RwLock<HashMap<String, (WorkProof, LedgerReceipt)>>,
    workloads: RwLock<HashMap<Address, UserWorkload>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded(&self, task_id: &str) -> Option<WorkProof> {
        self.proofs.read().await.get(task_id).map(|(p, _)| p.clone())
    }

    pub async fn len(&self) -> usize {
        self.proofs.read().await.len()
    }

    /// Seed an on-chain style aggregate for `user`
    pub async fn set_workload(&self, user: Address, workload: UserWorkload) {
        self.workloads.write().await.insert(user, workload);
    }
}

#[async_trait]
impl WorkLedger for MemoryLedger {
    async fn submit(&self, proof: &WorkProof) -> Result<LedgerReceipt, LedgerError> {
        let mut proofs = self.proofs.write().await;
        if let Some((_, receipt)) = proofs.get(&proof.task_id) {
            return Ok(receipt.clone());
        }
        let receipt = LedgerReceipt {
            tx_hash: proof.proof_hash,
            block_number: proofs.len() as u64 + 1,
        };
        proofs.insert(proof.task_id.clone(), (proof.clone(), receipt.clone()));
        Ok(receipt)
    }

    async fn user_workload(&self, user: Address) -> Result<UserWorkload, LedgerError> {
        Ok(self.workloads.read().await.get(&user).cloned().unwrap_or_default())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
