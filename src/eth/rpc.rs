//! Minimal Ethereum JSON-RPC client
//!
//! Covers the calls the ledger and the payment verifier need and nothing else.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Errors from Ethereum JSON-RPC calls
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}")]
    HttpStatus { context: &'static str, status: http::StatusCode },
    #[error("RPC error {code} from {method}: {message}")]
    Rpc { method: String, code: i64, message: String },
    #[error("Failed to decode {context}: {message}")]
    Decode { context: &'static str, message: String },
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// A log entry from a transaction receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub block_number: u64,
    /// `1` on success, `0` on revert
    #[serde(with = "quantity")]
    pub status: u64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    #[serde(default)]
    pub input: Bytes,
}

/// Hex-quantity (`"0x1a"`) <-> u64
pub(crate) mod quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_quantity(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn parse_quantity(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("quantity '{}' lacks 0x prefix", s))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad quantity '{}': {}", s, e))
}

/// JSON-RPC client for one Ethereum endpoint
#[derive(Debug)]
pub struct EthRpc {
    url: Url,
    client: Client,
    request_id: AtomicU64,
}

impl EthRpc {
    pub fn new(url: Url) -> Self {
        Self::with_timeout(url, Duration::from_secs(30))
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url,
            client,
            request_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Issue a raw call and decode the result
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        tracing::trace!(method, id, "eth rpc ->");

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|source| RpcError::Http { context: "send", source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::HttpStatus { context: "eth rpc", status });
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|source| RpcError::Http { context: "read body", source })?;

        if let Some(err) = envelope.error {
            return Err(RpcError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null)).map_err(|e| RpcError::Decode {
            context: "result",
            message: format!("{}: {}", method, e),
        })
    }

    async fn call_quantity(&self, method: &str, params: Value) -> Result<u64, RpcError> {
        let s: String = self.call(method, params).await?;
        parse_quantity(&s).map_err(|message| RpcError::Decode { context: "quantity", message })
    }

    async fn call_u256(&self, method: &str, params: Value) -> Result<U256, RpcError> {
        let s: String = self.call(method, params).await?;
        U256::from_str(&s).map_err(|e| RpcError::Decode {
            context: "uint256",
            message: e.to_string(),
        })
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        self.call_quantity("eth_chainId", json!([])).await
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.call_quantity("eth_blockNumber", json!([])).await
    }

    pub async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError> {
        self.call_quantity("eth_getTransactionCount", json!([address, "pending"]))
            .await
    }

    /// Base fee of the latest block (0 on pre-London chains)
    pub async fn latest_base_fee(&self) -> Result<u128, RpcError> {
        let block: Value = self.call("eth_getBlockByNumber", json!(["latest", false])).await?;
        match block.get("baseFeePerGas").and_then(Value::as_str) {
            Some(s) => parse_quantity(s)
                .map(u128::from)
                .map_err(|message| RpcError::Decode { context: "baseFeePerGas", message }),
            None => Ok(0),
        }
    }

    pub async fn max_priority_fee(&self) -> Result<u128, RpcError> {
        let fee = self.call_u256("eth_maxPriorityFeePerGas", json!([])).await?;
        Ok(fee.saturating_to())
    }

    pub async fn estimate_gas(&self, from: Address, to: Address, data: &Bytes) -> Result<u64, RpcError> {
        self.call_quantity("eth_estimateGas", json!([{ "from": from, "to": to, "data": data }]))
            .await
    }

    /// Read-only contract call against the latest block
    pub async fn eth_call(&self, to: Address, data: &Bytes) -> Result<Bytes, RpcError> {
        self.call("eth_call", json!([{ "to": to, "data": data }, "latest"])).await
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
        let encoded = format!("0x{}", hex::encode(raw));
        self.call("eth_sendRawTransaction", json!([encoded])).await
    }

    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, RpcError> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }

    pub async fn transaction_by_hash(&self, hash: B256) -> Result<Option<Transaction>, RpcError> {
        self.call("eth_getTransactionByHash", json!([hash])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("26").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_receipt_decodes() {
        let json = r#"{
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x10",
            "status": "0x1",
            "from": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
            "to": null,
            "logs": [{
                "address": "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913",
                "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
                "data": "0x00000000000000000000000000000000000000000000000000000000000f4240"
            }]
        }"#;
        let receipt: TransactionReceipt = serde_json::from_str(json).unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.status, 1);
        assert!(receipt.to.is_none());
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(U256::from_be_slice(&receipt.logs[0].data), U256::from(1_000_000u64));
    }

    #[test]
    fn test_transaction_decodes() {
        let json = r#"{
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "from": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
            "to": "0x0000000000000000000000000000000000000002",
            "value": "0xde0b6b3a7640000",
            "input": "0x"
        }"#;
        let tx: Transaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u128));
        assert!(tx.input.is_empty());
    }
}
