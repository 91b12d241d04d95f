//! Payment proof verification
//!
//! Two modes:
//! - `trust`: the proof is taken at face value once its claims match the price.
//!   No chain access and no replay tracking. Suitable for compatibility testing only.
//! - `chain`: the claimed transaction is fetched and must actually pay the
//!   configured recipient at least the price, with enough confirmations and
//!   within the payment age window. Each transaction is spendable once.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{sol, SolEvent};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::pricing::ToolPricingPolicy;
use super::types::PaymentProof;
use crate::eth::{to_base_units, Asset, EthRpc, RpcError, TokenError, TokenRegistry};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    #[default]
    Trust,
    Chain,
}

impl std::fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMode::Trust => write!(f, "trust"),
            VerificationMode::Chain => write!(f, "chain"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Malformed transaction hash: {0}")]
    MalformedHash(String),
    #[error("Proof currency {proof} does not match required {required}")]
    CurrencyMismatch { proof: String, required: String },
    #[error("Proof chain {proof} does not match required {required}")]
    ChainMismatch { proof: u64, required: u64 },
    #[error("Paid {paid} is less than the required {required}")]
    Underpaid { paid: String, required: String },
    #[error("Transaction {0} not found")]
    NotFound(B256),
    #[error("Transaction {0} failed on chain")]
    Failed(B256),
    #[error("Transaction has {have} confirmations, {need} required")]
    NotFinal { have: u64, need: u64 },
    #[error("Transaction is {age} blocks old, payments older than {max} blocks are not accepted")]
    Expired { age: u64, max: u64 },
    #[error("Transaction does not pay {0}")]
    WrongRecipient(Address),
    #[error("Transaction hash already redeemed")]
    AlreadyRedeemed,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Chain lookup failed: {0}")]
    Rpc(#[from] RpcError),
}

/// Accepted payment, as established by the verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    pub mode: VerificationMode,
    /// Parsed transaction hash, when the proof carries a well-formed one
    pub tx_hash: Option<B256>,
    /// Present when the payment may be spent only once
    pub redemption: Option<Redemption>,
}

/// Spend-once bookkeeping for an on-chain payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redemption {
    pub tx_hash: B256,
    /// Chain head observed while verifying
    pub head_block: u64,
    /// Last head at which this payment still verifies; replays after it fail on age
    pub valid_through_block: u64,
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, proof: &PaymentProof, policy: &ToolPricingPolicy) -> Result<VerifiedPayment, VerifyError>;

    fn mode(&self) -> VerificationMode;
}

fn parse_tx_hash(s: &str) -> Result<B256, VerifyError> {
    let trimmed = s.trim();
    if trimmed.len() != 66 || !trimmed.starts_with("0x") {
        return Err(VerifyError::MalformedHash(s.to_string()));
    }
    B256::from_str(trimmed).map_err(|_| VerifyError::MalformedHash(s.to_string()))
}

/// Claims in the proof must line up with the price; shared by both modes
fn check_claims(proof: &PaymentProof, policy: &ToolPricingPolicy) -> Result<(), VerifyError> {
    if !proof.currency.eq_ignore_ascii_case(&policy.currency) {
        return Err(VerifyError::CurrencyMismatch {
            proof: proof.currency.clone(),
            required: policy.currency.clone(),
        });
    }
    if let Some(chain_id) = proof.chain_id {
        if chain_id != policy.chain_id {
            return Err(VerifyError::ChainMismatch {
                proof: chain_id,
                required: policy.chain_id,
            });
        }
    }
    if proof.amount < policy.price_per_call {
        return Err(VerifyError::Underpaid {
            paid: proof.amount.to_string(),
            required: policy.price_per_call.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Trust mode
// ============================================================================

#[derive(Debug, Default)]
pub struct TrustVerifier {
    warned: AtomicBool,
}

impl TrustVerifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentVerifier for TrustVerifier {
    async fn verify(&self, proof: &PaymentProof, policy: &ToolPricingPolicy) -> Result<VerifiedPayment, VerifyError> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("Payment proofs are accepted without on-chain verification (payment_verification = trust)");
        }
        check_claims(proof, policy)?;
        Ok(VerifiedPayment {
            mode: VerificationMode::Trust,
            tx_hash: parse_tx_hash(&proof.transaction_hash).ok(),
            redemption: None,
        })
    }

    fn mode(&self) -> VerificationMode {
        VerificationMode::Trust
    }
}

// ============================================================================
// Chain mode
// ============================================================================

/// Default payment age window, in blocks (about a day of 2 s blocks)
pub const DEFAULT_MAX_PAYMENT_AGE_BLOCKS: u64 = 43_200;

pub struct ChainVerifier {
    rpc: EthRpc,
    pay_to: Address,
    tokens: TokenRegistry,
    min_confirmations: u64,
    max_age_blocks: u64,
}

impl ChainVerifier {
    pub fn new(rpc: EthRpc, pay_to: Address, tokens: TokenRegistry, min_confirmations: u64) -> Self {
        Self {
            rpc,
            pay_to,
            tokens,
            min_confirmations,
            max_age_blocks: DEFAULT_MAX_PAYMENT_AGE_BLOCKS,
        }
    }

    /// Reject payments mined more than `blocks` blocks before the current head
    pub fn with_max_age_blocks(mut self, blocks: u64) -> Self {
        self.max_age_blocks = blocks.max(self.min_confirmations).max(1);
        self
    }

    async fn paid_native(&self, tx_hash: B256) -> Result<U256, VerifyError> {
        let tx = self
            .rpc
            .transaction_by_hash(tx_hash)
            .await?
            .ok_or(VerifyError::NotFound(tx_hash))?;
        if tx.to != Some(self.pay_to) {
            return Err(VerifyError::WrongRecipient(self.pay_to));
        }
        Ok(tx.value)
    }
}

/// Sum of ERC-20 `Transfer` logs from `token` to `pay_to`
fn paid_erc20(logs: &[crate::eth::rpc::Log], token: Address, pay_to: Address) -> U256 {
    let recipient_topic = pay_to.into_word();
    logs.iter()
        .filter(|log| log.address == token)
        .filter(|log| log.topics.len() == 3 && log.topics[0] == Transfer::SIGNATURE_HASH)
        .filter(|log| log.topics[2] == recipient_topic)
        .map(|log| U256::from_be_slice(&log.data))
        .fold(U256::ZERO, |acc, v| acc.saturating_add(v))
}

/// A payment with `confirmations` counts as `confirmations` blocks old
fn check_age(confirmations: u64, max_age_blocks: u64) -> Result<(), VerifyError> {
    if confirmations > max_age_blocks {
        return Err(VerifyError::Expired {
            age: confirmations,
            max: max_age_blocks,
        });
    }
    Ok(())
}

#[async_trait]
impl PaymentVerifier for ChainVerifier {
    async fn verify(&self, proof: &PaymentProof, policy: &ToolPricingPolicy) -> Result<VerifiedPayment, VerifyError> {
        check_claims(proof, policy)?;
        let tx_hash = parse_tx_hash(&proof.transaction_hash)?;
        let asset = self.tokens.get(&policy.currency)?;
        let required = to_base_units(policy.price_per_call, asset.decimals())?;

        let receipt = self
            .rpc
            .transaction_receipt(tx_hash)
            .await?
            .ok_or(VerifyError::NotFound(tx_hash))?;
        if receipt.status != 1 {
            return Err(VerifyError::Failed(tx_hash));
        }

        let head = self.rpc.block_number().await?;
        let confirmations = head.saturating_sub(receipt.block_number) + 1;
        if confirmations < self.min_confirmations {
            return Err(VerifyError::NotFinal {
                have: confirmations,
                need: self.min_confirmations,
            });
        }
        check_age(confirmations, self.max_age_blocks)?;

        let paid = match asset {
            Asset::Native { .. } => self.paid_native(tx_hash).await?,
            Asset::Erc20 { address, .. } => {
                let paid = paid_erc20(&receipt.logs, address, self.pay_to);
                if paid.is_zero() {
                    return Err(VerifyError::WrongRecipient(self.pay_to));
                }
                paid
            }
        };

        if paid < required {
            return Err(VerifyError::Underpaid {
                paid: paid.to_string(),
                required: required.to_string(),
            });
        }

        tracing::info!(%tx_hash, confirmations, %paid, "Payment verified on chain");
        Ok(VerifiedPayment {
            mode: VerificationMode::Chain,
            tx_hash: Some(tx_hash),
            redemption: Some(Redemption {
                tx_hash,
                head_block: head,
                valid_through_block: receipt.block_number.saturating_add(self.max_age_blocks.saturating_sub(1)),
            }),
        })
    }

    fn mode(&self) -> VerificationMode {
        VerificationMode::Chain
    }
}
