//! Currency registry: maps a pricing currency symbol to the asset that pays it

use std::collections::HashMap;

use alloy_primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Settlement asset for a currency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    /// Chain-native coin (ETH and friends)
    Native { decimals: u8 },
    /// ERC-20 token contract
    Erc20 { address: Address, decimals: u8 },
}

impl Asset {
    pub fn decimals(&self) -> u8 {
        match self {
            Asset::Native { decimals } | Asset::Erc20 { decimals, .. } => *decimals,
        }
    }
}

/// Token entry as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenConfig {
    /// ERC-20 contract; omitted for the native coin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")]
    pub address: Option<Address>,
    #[schema(example = 6)]
    pub decimals: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),
    #[error("Amount {amount} has more precision than {decimals} decimals allow")]
    TooPrecise { amount: Decimal, decimals: u8 },
    #[error("Amount {0} is negative")]
    Negative(Decimal),
}

/// Symbol-keyed currency table; symbols match case-insensitively
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    assets: HashMap<String, Asset>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        let mut assets = HashMap::new();
        assets.insert("ETH".to_string(), Asset::Native { decimals: 18 });
        Self { assets }
    }
}

impl TokenRegistry {
    /// Built-in native coin plus configured tokens (configured entries win)
    pub fn from_config(tokens: &HashMap<String, TokenConfig>) -> Self {
        let mut registry = Self::default();
        for (symbol, cfg) in tokens {
            let asset = match cfg.address {
                Some(address) => Asset::Erc20 { address, decimals: cfg.decimals },
                None => Asset::Native { decimals: cfg.decimals },
            };
            registry.assets.insert(symbol.to_ascii_uppercase(), asset);
        }
        registry
    }

    pub fn get(&self, currency: &str) -> Result<Asset, TokenError> {
        self.assets
            .get(&currency.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| TokenError::UnknownCurrency(currency.to_string()))
    }

    pub fn contains(&self, currency: &str) -> bool {
        self.assets.contains_key(&currency.to_ascii_uppercase())
    }
}

/// Convert a decimal amount to integer base units (`1.5` USDC -> `1500000`)
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256, TokenError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(TokenError::Negative(amount));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals as u32 {
        return Err(TokenError::TooPrecise { amount, decimals });
    }
    let mantissa = U256::from(normalized.mantissa().unsigned_abs());
    let factor = U256::from(10u8).pow(U256::from(decimals as u32 - scale));
    Ok(mantissa * factor)
}
