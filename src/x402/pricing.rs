//! Tool pricing catalog
//!
//! Loaded once at startup. Every invocable tool must appear here; a tool missing
//! from the catalog is a configuration error, never implicitly free.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::eth::TokenRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PricingPolicy {
    Free,
    FlatPerCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolPricingPolicy {
    pub tool_name: String,
    pub policy: PricingPolicy,
    #[serde(default)]
    #[schema(value_type = String, example = "0.01")]
    pub price_per_call: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Connection the tool is served from
    pub connection_id: String,
    /// Name on the remote when it differs from `toolName`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_currency() -> String {
    "USDC".to_string()
}

fn default_chain_id() -> u64 {
    8453
}

impl ToolPricingPolicy {
    pub fn is_priced(&self) -> bool {
        self.policy == PricingPolicy::FlatPerCall
    }

    /// Tool name to send upstream
    pub fn remote_name(&self) -> &str {
        self.remote_tool.as_deref().unwrap_or(&self.tool_name)
    }

    fn validate(&self, tokens: &TokenRegistry) -> Result<()> {
        if self.tool_name.trim().is_empty() {
            anyhow::bail!("Tool name cannot be empty");
        }
        if self.connection_id.trim().is_empty() {
            anyhow::bail!("connectionId cannot be empty");
        }
        match self.policy {
            PricingPolicy::Free => {
                if !self.price_per_call.is_zero() {
                    anyhow::bail!("Free tool must not carry a price (got {})", self.price_per_call);
                }
            }
            PricingPolicy::FlatPerCall => {
                if self.price_per_call <= Decimal::ZERO {
                    anyhow::bail!("Flat-per-call tool needs a positive pricePerCall");
                }
                let asset = tokens
                    .get(&self.currency)
                    .with_context(|| format!("Currency {} is not configured", self.currency))?;
                crate::eth::to_base_units(self.price_per_call, asset.decimals())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PricingCatalog {
    #[serde(default)]
    tools: Vec<ToolPricingPolicy>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl PricingCatalog {
    pub fn from_file(path: impl AsRef<Path>, tokens: &TokenRegistry) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pricing file: {}", path.display()))?;
        Self::from_str(&content, tokens)
    }

    pub fn from_str(content: &str, tokens: &TokenRegistry) -> Result<Self> {
        let catalog: Self = serde_json::from_str(content).context("Failed to parse pricing JSON")?;
        Self::from_policies(catalog.tools, tokens)
    }

    pub fn from_policies(tools: Vec<ToolPricingPolicy>, tokens: &TokenRegistry) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, tool) in tools.iter().enumerate() {
            if index.insert(tool.tool_name.clone(), i).is_some() {
                anyhow::bail!("Duplicate tool name: {}", tool.tool_name);
            }
            tool.validate(tokens)
                .with_context(|| format!("Invalid pricing for tool: {}", tool.tool_name))?;
        }
        Ok(Self { tools, index })
    }

    pub fn get(&self, tool_name: &str) -> Option<&ToolPricingPolicy> {
        self.index.get(tool_name).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[ToolPricingPolicy] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
