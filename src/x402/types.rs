//! Payment challenge and proof types
//!
//! A challenge is built fresh for every rejected call and never stored.

use alloy_primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

use super::pricing::ToolPricingPolicy;
use crate::eth::{to_base_units, Asset, TokenError, TokenRegistry};

/// What a caller must pay before a priced tool runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    #[schema(value_type = String, example = "0.25")]
    pub amount: Decimal,
    pub currency: String,
    pub chain_id: u64,
    pub payment_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[schema(value_type = String)]
    pub pay_to: Address,
    pub tool_name: String,
}

/// Caller-supplied evidence of payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    #[schema(example = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060")]
    pub transaction_hash: String,
    #[schema(value_type = String, example = "0.25")]
    pub amount: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

/// Static inputs for building challenges
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub pay_to: Address,
    /// Hosted payment page; EIP-681 URIs are used when unset
    pub payment_base_url: Option<Url>,
    /// QR renderer taking `?data=<paymentUrl>`
    pub qr_base_url: Option<Url>,
    pub tokens: TokenRegistry,
}

impl ChallengeConfig {
    pub fn challenge(&self, policy: &ToolPricingPolicy) -> Result<PaymentChallenge, TokenError> {
        let payment_url = match &self.payment_base_url {
            Some(base) => hosted_payment_url(base, policy, self.pay_to),
            None => {
                let asset = self.tokens.get(&policy.currency)?;
                let units = to_base_units(policy.price_per_call, asset.decimals())?;
                eip681_uri(asset, policy.chain_id, self.pay_to, units)
            }
        };

        let qr_code = self.qr_base_url.as_ref().map(|base| {
            let mut url = base.clone();
            url.query_pairs_mut().append_pair("data", &payment_url);
            url.to_string()
        });

        Ok(PaymentChallenge {
            amount: policy.price_per_call,
            currency: policy.currency.clone(),
            chain_id: policy.chain_id,
            payment_url,
            qr_code,
            pay_to: self.pay_to,
            tool_name: policy.tool_name.clone(),
        })
    }
}

fn hosted_payment_url(base: &Url, policy: &ToolPricingPolicy, pay_to: Address) -> String {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("tool", &policy.tool_name)
        .append_pair("amount", &policy.price_per_call.to_string())
        .append_pair("currency", &policy.currency)
        .append_pair("chainId", &policy.chain_id.to_string())
        .append_pair("payTo", &pay_to.to_string());
    url.to_string()
}

/// EIP-681 payment request URI
fn eip681_uri(asset: Asset, chain_id: u64, pay_to: Address, units: U256) -> String {
    match asset {
        Asset::Native { .. } => format!("ethereum:{}@{}?value={}", pay_to, chain_id, units),
        Asset::Erc20 { address, .. } => format!(
            "ethereum:{}@{}/transfer?address={}&uint256={}",
            address, chain_id, pay_to, units
        ),
    }
}
