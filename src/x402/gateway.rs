//! Metered tool invocation
//!
//! Per call:
//! - tool not in the catalog: configuration error
//! - free tool: execute
//! - priced tool without proof: payment challenge
//! - priced tool with proof: verify, then execute
//!
//! Every execution yields a [`WorkProof`] that is queued for settlement. The
//! response does not wait for the ledger.
//!
//! Payments verified on chain are spent once. A spent payment is remembered
//! until the chain head moves past its age window; after that a replay fails
//! verification on age instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::pricing::{PricingCatalog, ToolPricingPolicy};
use super::types::{ChallengeConfig, PaymentChallenge, PaymentProof};
use super::verify::{PaymentVerifier, Redemption, VerifyError};
use crate::error::GatewayError;
use crate::identity::CallerIdentity;
use crate::ledger::{SettlementStatus, WorkProof, WorkProofRecorder};
use crate::mcp::ConnectionRegistry;
use crate::prelude::unix_millis;

/// Runs a catalogued tool and returns its output
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, policy: &ToolPricingPolicy, input: Value) -> Result<Value, GatewayError>;
}

/// Executes tools on the connection named by their catalog entry
pub struct RegistryExecutor {
    registry: ConnectionRegistry,
}

impl RegistryExecutor {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for RegistryExecutor {
    async fn execute(&self, policy: &ToolPricingPolicy, input: Value) -> Result<Value, GatewayError> {
        let handle = self.registry.get_client(&policy.connection_id)?;
        let result = handle
            .client
            .call_tool(policy.remote_name(), input)
            .await
            .map_err(|e| match GatewayError::from(e) {
                GatewayError::UpstreamFailure(msg) | GatewayError::UnsupportedCapability(msg) => {
                    GatewayError::ToolExecutionFailure(msg)
                }
                other => other,
            })?;

        if result.is_error {
            return Err(GatewayError::ToolExecutionFailure(result.text()));
        }
        serde_json::to_value(&result).map_err(|e| GatewayError::ToolExecutionFailure(e.to_string()))
    }
}

/// One invocation request
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub tool_name: String,
    pub input: Value,
    pub payment_info: Option<PaymentProof>,
    pub caller: CallerIdentity,
}

/// Successful execution
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub task_id: String,
    pub output: Value,
    pub work_proof: WorkProof,
    pub caller: CallerIdentity,
    pub settlement: SettlementStatus,
}

#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    PaymentRequired(PaymentChallenge),
    Executed(ExecutionReceipt),
}

pub struct MeteredGateway {
    catalog: Arc<PricingCatalog>,
    challenges: ChallengeConfig,
    verifier: Arc<dyn PaymentVerifier>,
    executor: Arc<dyn ToolExecutor>,
    recorder: WorkProofRecorder,
    /// Spent payment transactions, mapped to the last block they verify at
    redeemed: Mutex<HashMap<B256, u64>>,
}

impl MeteredGateway {
    pub fn new(
        catalog: Arc<PricingCatalog>,
        challenges: ChallengeConfig,
        verifier: Arc<dyn PaymentVerifier>,
        executor: Arc<dyn ToolExecutor>,
        recorder: WorkProofRecorder,
    ) -> Self {
        Self {
            catalog,
            challenges,
            verifier,
            executor,
            recorder,
            redeemed: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    pub fn recorder(&self) -> &WorkProofRecorder {
        &self.recorder
    }

    pub fn verifier_mode(&self) -> super::verify::VerificationMode {
        self.verifier.mode()
    }

    fn redeemed(&self) -> std::sync::MutexGuard<'_, HashMap<B256, u64>> {
        self.redeemed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of spent payments still remembered
    pub fn redeemed_count(&self) -> usize {
        self.redeemed().len()
    }

    fn redeem(&self, redemption: &Redemption) -> Result<(), GatewayError> {
        let mut redeemed = self.redeemed();
        // Anything valid only before the current head can no longer verify
        redeemed.retain(|_, valid_through| *valid_through >= redemption.head_block);
        if redeemed.contains_key(&redemption.tx_hash) {
            return Err(GatewayError::PaymentRejected(VerifyError::AlreadyRedeemed.to_string()));
        }
        redeemed.insert(redemption.tx_hash, redemption.valid_through_block);
        Ok(())
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome, GatewayError> {
        let policy = self
            .catalog
            .get(&request.tool_name)
            .ok_or_else(|| GatewayError::UnknownTool(request.tool_name.clone()))?;

        let redeemed = if policy.is_priced() {
            let Some(proof) = &request.payment_info else {
                let challenge = self
                    .challenges
                    .challenge(policy)
                    .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
                tracing::info!(tool = %policy.tool_name, amount = %challenge.amount, currency = %challenge.currency, "Payment required");
                return Ok(InvokeOutcome::PaymentRequired(challenge));
            };

            let verified = self
                .verifier
                .verify(proof, policy)
                .await
                .map_err(|e| GatewayError::PaymentRejected(e.to_string()))?;

            if let Some(redemption) = &verified.redemption {
                self.redeem(redemption)?;
            }
            verified.redemption
        } else {
            None
        };

        let receipt = match self.execute(policy, request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // Payment stays spendable when the tool itself failed
                if let Some(redemption) = redeemed {
                    self.redeemed().remove(&redemption.tx_hash);
                }
                return Err(e);
            }
        };

        Ok(InvokeOutcome::Executed(receipt))
    }

    async fn execute(&self, policy: &ToolPricingPolicy, request: InvokeRequest) -> Result<ExecutionReceipt, GatewayError> {
        let input_bytes = serde_json::to_vec(&request.input)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let started = Instant::now();
        let output = self.executor.execute(policy, request.input).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let output_bytes = serde_json::to_vec(&output)
            .map_err(|e| GatewayError::ToolExecutionFailure(e.to_string()))?;

        let task_id = WorkProof::new_task_id();
        let work_proof = WorkProof::build(
            task_id.clone(),
            policy.tool_name.clone(),
            &input_bytes,
            &output_bytes,
            execution_time_ms,
            unix_millis(),
        );

        tracing::info!(
            task_id = %task_id,
            tool = %policy.tool_name,
            caller = %request.caller.canonical_uuid,
            execution_time_ms,
            input_size = work_proof.input_size,
            output_size = work_proof.output_size,
            "Tool executed"
        );

        let settlement = match self.recorder.enqueue(work_proof.clone(), &request.caller).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Work proof could not be queued");
                SettlementStatus::Failed {
                    error: GatewayError::LedgerSubmissionFailure(e.to_string()).to_string(),
                    attempts: 0,
                }
            }
        };

        Ok(ExecutionReceipt {
            task_id,
            output,
            work_proof,
            caller: request.caller,
            settlement,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::eth::TokenRegistry;
    use crate::ledger::{MemoryLedger, RecorderSettings};
    use crate::x402::pricing::PricingPolicy;
    use crate::x402::verify::{TrustVerifier, VerificationMode, VerifiedPayment};
    use alloy_primitives::Address;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    pub(crate) const PAID_HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    /// Echoes its input; fails when the input has `"fail": true`
    #[derive(Default)]
    pub(crate) struct EchoExecutor {
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, _policy: &ToolPricingPolicy, input: Value) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(GatewayError::ToolExecutionFailure("tool crashed".to_string()));
            }
            Ok(json!({ "echo": input }))
        }
    }

    pub(crate) fn test_catalog() -> PricingCatalog {
        let tool = |name: &str, policy: PricingPolicy, price: Decimal| ToolPricingPolicy {
            tool_name: name.to_string(),
            policy,
            price_per_call: price,
            currency: "ETH".to_string(),
            chain_id: 8453,
            connection_id: "conn1".to_string(),
            remote_tool: None,
            description: None,
        };
        PricingCatalog::from_policies(
            vec![
                tool("echo", PricingPolicy::Free, Decimal::ZERO),
                tool("search", PricingPolicy::FlatPerCall, Decimal::new(25, 2)),
            ],
            &TokenRegistry::default(),
        )
        .unwrap()
    }

    /// Chain verification stand-in: a payment is mined at the head where it is
    /// first presented and verifies for `window` blocks from there
    pub(crate) struct OnChainVerifier {
        pub head: AtomicU64,
        window: u64,
        mined_at: Mutex<HashMap<B256, u64>>,
    }

    impl OnChainVerifier {
        pub(crate) fn new(head: u64, window: u64) -> Self {
            Self {
                head: AtomicU64::new(head),
                window,
                mined_at: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl PaymentVerifier for OnChainVerifier {
        async fn verify(&self, proof: &PaymentProof, _policy: &ToolPricingPolicy) -> Result<VerifiedPayment, VerifyError> {
            let tx_hash = B256::from_str(&proof.transaction_hash)
                .map_err(|_| VerifyError::MalformedHash(proof.transaction_hash.clone()))?;
            let head = self.head.load(Ordering::SeqCst);
            let block = *self.mined_at.lock().unwrap().entry(tx_hash).or_insert(head);
            let age = head - block + 1;
            if age > self.window {
                return Err(VerifyError::Expired { age, max: self.window });
            }
            Ok(VerifiedPayment {
                mode: VerificationMode::Chain,
                tx_hash: Some(tx_hash),
                redemption: Some(Redemption {
                    tx_hash,
                    head_block: head,
                    valid_through_block: block + self.window - 1,
                }),
            })
        }

        fn mode(&self) -> VerificationMode {
            VerificationMode::Chain
        }
    }

    pub(crate) fn test_gateway(executor: Arc<dyn ToolExecutor>) -> MeteredGateway {
        gateway_with(Arc::new(TrustVerifier::new()), executor)
    }

    fn gateway_with(verifier: Arc<dyn PaymentVerifier>, executor: Arc<dyn ToolExecutor>) -> MeteredGateway {
        let (recorder, _worker) = WorkProofRecorder::start(Arc::new(MemoryLedger::new()), RecorderSettings::default());
        MeteredGateway::new(
            Arc::new(test_catalog()),
            ChallengeConfig {
                pay_to: Address::repeat_byte(0x22),
                payment_base_url: None,
                qr_base_url: None,
                tokens: TokenRegistry::default(),
            },
            verifier,
            executor,
            recorder,
        )
    }

    pub(crate) fn paid() -> PaymentProof {
        PaymentProof {
            transaction_hash: PAID_HASH.to_string(),
            amount: Decimal::new(25, 2),
            currency: "ETH".to_string(),
            chain_id: Some(8453),
        }
    }

    fn request(tool: &str, input: Value, payment_info: Option<PaymentProof>) -> InvokeRequest {
        InvokeRequest {
            tool_name: tool.to_string(),
            input,
            payment_info,
            caller: CallerIdentity::new("alice"),
        }
    }

    fn executed(outcome: InvokeOutcome) -> ExecutionReceipt {
        match outcome {
            InvokeOutcome::Executed(r) => r,
            InvokeOutcome::PaymentRequired(c) => panic!("unexpected challenge {:?}", c),
        }
    }

    #[tokio::test]
    async fn test_free_tool_runs_with_or_without_payment() {
        let gateway = test_gateway(Arc::new(EchoExecutor::default()));

        let a = executed(gateway.invoke(request("echo", json!({"x": 1}), None)).await.unwrap());
        assert_eq!(a.output["echo"]["x"], 1);

        let b = executed(gateway.invoke(request("echo", json!({"x": 2}), Some(paid()))).await.unwrap());
        assert_ne!(a.task_id, b.task_id);
    }

    #[tokio::test]
    async fn test_priced_tool_without_proof_is_challenged() {
        let executor = Arc::new(EchoExecutor::default());
        let gateway = test_gateway(executor.clone());

        match gateway.invoke(request("search", json!({}), None)).await.unwrap() {
            InvokeOutcome::PaymentRequired(challenge) => {
                assert_eq!(challenge.amount, Decimal::new(25, 2));
                assert_eq!(challenge.currency, "ETH");
                assert_eq!(challenge.chain_id, 8453);
                assert!(challenge.payment_url.starts_with("ethereum:"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_priced_tool_with_proof_executes() {
        let gateway = test_gateway(Arc::new(EchoExecutor::default()));
        let receipt = executed(gateway.invoke(request("search", json!({"q": "rust"}), Some(paid()))).await.unwrap());

        assert!(!receipt.task_id.is_empty());
        assert_eq!(receipt.work_proof.task_id, receipt.task_id);
        assert_eq!(receipt.work_proof.tool_name, "search");
        assert_eq!(receipt.work_proof.input_size, br#"{"q":"rust"}"#.len() as u64);
        assert!(receipt.settlement.is_pending() || matches!(receipt.settlement, SettlementStatus::Settled { .. }));
        assert_eq!(receipt.caller.canonical_uuid, crate::identity::normalize("alice"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_configuration_error() {
        let gateway = test_gateway(Arc::new(EchoExecutor::default()));
        assert!(matches!(
            gateway.invoke(request("nope", json!({}), None)).await,
            Err(GatewayError::UnknownTool(_))
        ));
    }

    fn paid_with(hash_byte: u8) -> PaymentProof {
        PaymentProof {
            transaction_hash: B256::repeat_byte(hash_byte).to_string(),
            ..paid()
        }
    }

    #[tokio::test]
    async fn test_trust_mode_accepts_repeated_proof() {
        let executor = Arc::new(EchoExecutor::default());
        let gateway = test_gateway(executor.clone());
        executed(gateway.invoke(request("search", json!({}), Some(paid()))).await.unwrap());
        executed(gateway.invoke(request("search", json!({}), Some(paid()))).await.unwrap());

        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.redeemed_count(), 0);
    }

    #[tokio::test]
    async fn test_chain_payment_cannot_be_replayed() {
        let executor = Arc::new(EchoExecutor::default());
        let gateway = gateway_with(Arc::new(OnChainVerifier::new(100, 10)), executor.clone());
        executed(gateway.invoke(request("search", json!({}), Some(paid()))).await.unwrap());

        match gateway.invoke(request("search", json!({}), Some(paid()))).await {
            Err(GatewayError::PaymentRejected(msg)) => assert!(msg.contains("already redeemed")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spent_payments_are_forgotten_past_their_window() {
        let verifier = Arc::new(OnChainVerifier::new(100, 10));
        let gateway = gateway_with(verifier.clone(), Arc::new(EchoExecutor::default()));
        executed(gateway.invoke(request("search", json!({}), Some(paid_with(0xaa)))).await.unwrap());
        executed(gateway.invoke(request("search", json!({}), Some(paid_with(0xbb)))).await.unwrap());
        assert_eq!(gateway.redeemed_count(), 2);

        verifier.head.store(120, Ordering::SeqCst);
        // Old payment is refused on age, not by the spent set
        match gateway.invoke(request("search", json!({}), Some(paid_with(0xaa)))).await {
            Err(GatewayError::PaymentRejected(msg)) => assert!(msg.contains("not accepted")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        executed(gateway.invoke(request("search", json!({}), Some(paid_with(0xcc)))).await.unwrap());
        assert_eq!(gateway.redeemed_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_execution_releases_payment() {
        let gateway = gateway_with(Arc::new(OnChainVerifier::new(100, 10)), Arc::new(EchoExecutor::default()));
        assert!(matches!(
            gateway.invoke(request("search", json!({"fail": true}), Some(paid()))).await,
            Err(GatewayError::ToolExecutionFailure(_))
        ));
        assert_eq!(gateway.redeemed_count(), 0);
        // Same proof is still good for a retry
        executed(gateway.invoke(request("search", json!({}), Some(paid()))).await.unwrap());
        assert_eq!(gateway.redeemed_count(), 1);
    }

    #[tokio::test]
    async fn test_inconsistent_proof_rejected() {
        let gateway = test_gateway(Arc::new(EchoExecutor::default()));
        let mut cheap = paid();
        cheap.amount = Decimal::new(1, 2);
        assert!(matches!(
            gateway.invoke(request("search", json!({}), Some(cheap))).await,
            Err(GatewayError::PaymentRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_executor_maps_missing_connection() {
        let executor = RegistryExecutor::new(ConnectionRegistry::new());
        let policy = test_catalog().get("echo").unwrap().clone();
        assert!(matches!(
            executor.execute(&policy, json!({})).await,
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }
}
