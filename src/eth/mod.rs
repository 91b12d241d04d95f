pub mod rpc;
pub use rpc::{EthRpc, RpcError, TransactionReceipt};

pub mod signer;
pub use signer::{recover_address, EvmSigner, RecoverableSignature, Signer, SignerError};

pub mod tokens;
pub use tokens::{to_base_units, Asset, TokenConfig, TokenError, TokenRegistry};

pub mod tx;
pub use tx::Eip1559Tx;

use std::str::FromStr;

use alloy_primitives::Address;

/// Parse a `0x`-prefixed 20-byte address, rejecting anything else
pub fn parse_address(s: &str) -> Option<Address> {
    let s = s.trim();
    if s.len() != 42 || !s.starts_with("0x") {
        return None;
    }
    Address::from_str(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert!(parse_address("0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf").is_some());
        assert!(parse_address("7E5F4552091A69125d5DfCb7b8C2659029395Bdf").is_none());
        assert!(parse_address("alice@example.com").is_none());
        assert!(parse_address("0x1234").is_none());
    }
}
