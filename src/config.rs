//! Global configuration management for mcp402
//!
//! Configuration can be loaded from:
//! - JSON files (e.g., /etc/mcp402/config.json)
//! - Inline JSON strings (via CLI arguments)
//! - Environment variables (MCP402_*)
//!
//! CLI flags override file values; built-in defaults come last.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

use crate::eth::{parse_address, EvmSigner, TokenConfig, TokenRegistry};
use crate::ledger::{EvmLedgerSettings, RecorderSettings};
use crate::logging::LogFormat;
use crate::mcp::ConnectionSource;
use crate::x402::{ChallengeConfig, PricingCatalog, VerificationMode, DEFAULT_MAX_PAYMENT_AGE_BLOCKS};

pub const DEFAULT_PORT: u16 = 3000;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LEDGER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_LEDGER_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LEDGER_BACKOFF_MS: u64 = 500;
const DEFAULT_MIN_CONFIRMATIONS: u64 = 1;
const DEFAULT_STATUS_RETENTION_SECS: u64 = 3600;

// ============================================================================
// Configuration Arguments
// ============================================================================

/// Common configuration arguments (used across CLI commands)
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigArgs {
    /// Global configuration file (JSON file path or JSON string).
    ///
    /// - A file path: --config /etc/mcp402/config.json
    ///
    /// - Inline JSON: --config '{"port":3000,"pay_to":"0x..."}'
    ///
    #[arg(long = "config", short = 'c', env = "MCP402_CONFIG", value_name = "file.json or {json}")]
    pub config: Option<String>,

    /// Currency table (JSON file path or JSON string).
    ///
    /// Maps a currency symbol to its ERC-20 contract and decimals, e.g.
    /// '{"USDC":{"address":"0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913","decimals":6}}'
    ///
    /// ETH (native, 18 decimals) is always available.
    ///
    #[arg(long, env = "MCP402_TOKENS", value_name = "file.json or {json}")]
    pub tokens: Option<String>,

    /// Port to listen on (for server mode)
    #[arg(long, short = 'p', env = "MCP402_PORT")]
    pub port: Option<u16>,

    /// Connection records to establish at startup (JSON file)
    #[arg(long, env = "MCP402_CONNECTIONS", value_name = "FILE")]
    pub connections: Option<PathBuf>,

    /// Tool pricing catalog (JSON file path or JSON string)
    #[arg(long, env = "MCP402_PRICING", value_name = "file.json or {json}")]
    pub pricing: Option<String>,

    /// Address receiving tool payments
    #[arg(long, env = "MCP402_PAY_TO", value_name = "0x...")]
    pub pay_to: Option<String>,

    /// Hosted payment page used in payment challenges
    ///
    /// When unset, challenges carry an EIP-681 `ethereum:` URI instead.
    ///
    #[arg(long, env = "MCP402_PAYMENT_BASE_URL", value_name = "http(s)://...")]
    pub payment_base_url: Option<String>,

    /// QR renderer; the payment URL is passed as `?data=`
    #[arg(long, env = "MCP402_QR_BASE_URL", value_name = "http(s)://...")]
    pub qr_base_url: Option<String>,

    /// How payment proofs are checked
    ///
    /// - trust: accepted at face value when the claimed amount covers the price
    ///
    /// - chain: the transaction is looked up and must actually pay `pay_to`
    ///
    #[arg(long, value_enum, env = "MCP402_PAYMENT_VERIFICATION")]
    pub payment_verification: Option<VerificationMode>,

    /// JSON-RPC endpoint for payment verification (chain mode)
    #[arg(long, env = "MCP402_VERIFICATION_RPC_URL", value_name = "http(s)://...")]
    pub verification_rpc_url: Option<String>,

    /// Confirmations a payment needs before it is accepted (chain mode)
    #[arg(long, env = "MCP402_MIN_CONFIRMATIONS")]
    pub min_confirmations: Option<u64>,

    /// Oldest payment accepted, in blocks since its inclusion (chain mode)
    #[arg(long, env = "MCP402_PAYMENT_MAX_AGE_BLOCKS")]
    pub payment_max_age_blocks: Option<u64>,

    /// JSON-RPC endpoint of the chain hosting the ledger contract
    ///
    /// Without a ledger endpoint work proofs are kept in memory only.
    ///
    #[arg(long, env = "MCP402_LEDGER_RPC_URL", value_name = "http(s)://...")]
    pub ledger_rpc_url: Option<String>,

    /// Work-proof ledger contract address
    #[arg(long, env = "MCP402_LEDGER_CONTRACT", value_name = "0x...")]
    pub ledger_contract: Option<String>,

    /// Private key submitting work proofs (hex string or @filename)
    #[arg(long, env = "MCP402_LEDGER_KEY", value_name = "0x... or @file", hide_env_values = true)]
    pub ledger_key: Option<String>,

    /// Chain id of the ledger chain
    #[arg(long, env = "MCP402_LEDGER_CHAIN_ID")]
    pub ledger_chain_id: Option<u64>,

    /// Bound on every call to a remote MCP server, in seconds
    #[arg(long, env = "MCP402_UPSTREAM_TIMEOUT_SECS")]
    pub upstream_timeout_secs: Option<u64>,

    /// Bound on one ledger submission attempt, in seconds
    #[arg(long, env = "MCP402_LEDGER_TIMEOUT_SECS")]
    pub ledger_timeout_secs: Option<u64>,

    /// How long settled or failed work-proof statuses stay queryable, in seconds
    #[arg(long, env = "MCP402_LEDGER_STATUS_RETENTION_SECS")]
    pub ledger_status_retention_secs: Option<u64>,

    // -------------------------------------------------------------------------
    // Logging/Tracing Options
    // -------------------------------------------------------------------------

    /// Enable verbose output (INFO level logging)
    ///
    /// Default is WARN level. Use -v for INFO, -d for DEBUG.
    ///
    #[arg(short = 'v', long, env = "MCP402_VERBOSE")]
    pub verbose: bool,

    /// Enable debug output (DEBUG level logging)
    #[arg(short = 'd', long, env = "MCP402_DEBUG", conflicts_with = "verbose")]
    pub debug: bool,

    /// Quiet mode - only show errors
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,

    /// Silent mode - suppress all terminal log output
    ///
    /// Log file output (if configured) is unaffected.
    ///
    #[arg(long, short = 's', conflicts_with_all = ["verbose", "debug", "quiet"])]
    pub silent: bool,

    /// Log output format
    #[arg(long, short = 'L', default_value = "pretty", value_enum, env = "MCP402_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Write debug logs to file
    #[arg(long, short = 'l', env = "MCP402_LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

// ============================================================================
// Global Configuration
// ============================================================================

/// Global configuration structure (can be serialized/deserialized from JSON)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct GlobalConfig {
    /// Port for server to listen on
    pub port: Option<u16>,

    /// Connection record file
    #[schema(value_type = Option<String>)]
    pub connections: Option<PathBuf>,

    /// Pricing catalog (file path or inline JSON)
    pub pricing: Option<String>,

    /// Currency symbol -> token contract and decimals
    pub tokens: HashMap<String, TokenConfig>,

    // Payment
    pub pay_to: Option<String>,
    pub payment_base_url: Option<String>,
    pub qr_base_url: Option<String>,
    pub payment_verification: VerificationMode,
    pub verification_rpc_url: Option<String>,
    pub min_confirmations: u64,
    pub payment_max_age_blocks: u64,

    // Ledger
    pub ledger_rpc_url: Option<String>,
    pub ledger_contract: Option<String>,
    /// Hex private key or @filename
    pub ledger_key: Option<String>,
    pub ledger_chain_id: Option<u64>,
    pub ledger_timeout_secs: u64,
    pub ledger_max_attempts: u32,
    pub ledger_backoff_ms: u64,
    pub ledger_status_retention_secs: u64,

    pub upstream_timeout_secs: u64,

    /// Enable verbose output (INFO level logging)
    pub verbose: bool,

    /// Enable debug output (DEBUG level logging)
    pub debug: bool,

    /// Quiet mode - only show errors
    pub quiet: bool,

    /// Silent mode - suppress all terminal log output
    pub silent: bool,

    /// Log output format (pretty, json, compact)
    pub log_format: LogFormat,

    /// Write debug logs to file
    #[schema(value_type = Option<String>)]
    pub log_file: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: None,
            connections: None,
            pricing: None,
            tokens: HashMap::new(),
            pay_to: None,
            payment_base_url: None,
            qr_base_url: None,
            payment_verification: VerificationMode::default(),
            verification_rpc_url: None,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            payment_max_age_blocks: DEFAULT_MAX_PAYMENT_AGE_BLOCKS,
            ledger_rpc_url: None,
            ledger_contract: None,
            ledger_key: None,
            ledger_chain_id: None,
            ledger_timeout_secs: DEFAULT_LEDGER_TIMEOUT_SECS,
            ledger_max_attempts: DEFAULT_LEDGER_MAX_ATTEMPTS,
            ledger_backoff_ms: DEFAULT_LEDGER_BACKOFF_MS,
            ledger_status_retention_secs: DEFAULT_STATUS_RETENTION_SECS,
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            verbose: false,
            debug: false,
            quiet: false,
            silent: false,
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

/// Ledger endpoint, contract and signing key, when all are configured
pub struct LedgerConfig {
    pub rpc_url: Url,
    pub signer: Arc<EvmSigner>,
    pub settings: EvmLedgerSettings,
}

impl GlobalConfig {
    /// Load configuration with CLI args taking precedence over file config
    pub fn from_args(config: &ConfigArgs) -> Result<Self> {
        load_config(config)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn token_registry(&self) -> TokenRegistry {
        TokenRegistry::from_config(&self.tokens)
    }

    /// Load the pricing catalog; no catalog configured means no invocable tools
    pub fn pricing_catalog(&self, tokens: &TokenRegistry) -> Result<PricingCatalog> {
        match &self.pricing {
            Some(input) => {
                let json = load_json_string(input)?;
                PricingCatalog::from_str(&json, tokens)
            }
            None => {
                tracing::warn!("No pricing catalog configured, tool invocation is disabled");
                PricingCatalog::from_policies(Vec::new(), tokens)
            }
        }
    }

    pub fn connection_source(&self) -> Result<ConnectionSource> {
        match &self.connections {
            Some(path) => ConnectionSource::from_file(path),
            None => Ok(ConnectionSource::default()),
        }
    }

    pub fn pay_to_address(&self) -> Result<alloy_primitives::Address> {
        let pay_to = self.pay_to.as_deref().ok_or_else(|| {
            anyhow::anyhow!("Payment recipient required. Specify via --pay-to, MCP402_PAY_TO env var, or config file")
        })?;
        parse_address(pay_to).ok_or_else(|| anyhow::anyhow!("Invalid pay_to address: {}", pay_to))
    }

    pub fn challenge_config(&self, tokens: TokenRegistry) -> Result<ChallengeConfig> {
        Ok(ChallengeConfig {
            pay_to: self.pay_to_address()?,
            payment_base_url: parse_optional_url("payment_base_url", self.payment_base_url.as_deref())?,
            qr_base_url: parse_optional_url("qr_base_url", self.qr_base_url.as_deref())?,
            tokens,
        })
    }

    pub fn verification_rpc_url(&self) -> Result<Url> {
        let url = self.verification_rpc_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("payment_verification = chain needs verification_rpc_url")
        })?;
        Url::parse(url).with_context(|| format!("Invalid verification_rpc_url: {}", url))
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            max_attempts: self.ledger_max_attempts.max(1),
            backoff: Duration::from_millis(self.ledger_backoff_ms),
            attempt_timeout: Duration::from_secs(self.ledger_timeout_secs),
            retention: Duration::from_secs(self.ledger_status_retention_secs),
            ..RecorderSettings::default()
        }
    }

    /// Receipt wait inside one settlement attempt
    ///
    /// Kept below the attempt bound so an attempt ends on its own confirmation
    /// timeout rather than being cancelled mid-wait.
    pub fn ledger_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs) * 3 / 4
    }

    /// Ledger settings, or `None` when no ledger endpoint is configured
    ///
    /// A partially configured ledger (endpoint without contract or key) is an error.
    pub fn ledger(&self) -> Result<Option<LedgerConfig>> {
        let Some(rpc_url) = &self.ledger_rpc_url else {
            return Ok(None);
        };
        let rpc_url = Url::parse(rpc_url).with_context(|| format!("Invalid ledger_rpc_url: {}", rpc_url))?;

        let contract = self
            .ledger_contract
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ledger_rpc_url is set but ledger_contract is missing"))?;
        let contract = parse_address(contract)
            .ok_or_else(|| anyhow::anyhow!("Invalid ledger_contract address: {}", contract))?;

        let chain_id = self
            .ledger_chain_id
            .ok_or_else(|| anyhow::anyhow!("ledger_rpc_url is set but ledger_chain_id is missing"))?;

        let signer = self
            .load_ledger_signer()?
            .ok_or_else(|| anyhow::anyhow!("ledger_rpc_url is set but ledger_key is missing"))?;

        Ok(Some(LedgerConfig {
            rpc_url,
            signer: Arc::new(signer),
            settings: EvmLedgerSettings {
                chain_id,
                contract,
                confirm_timeout: self.ledger_confirm_timeout(),
                poll_interval: Duration::from_secs(2),
            },
        }))
    }

    /// Load the ledger signing key, if configured
    pub fn load_ledger_signer(&self) -> Result<Option<EvmSigner>> {
        let Some(key) = &self.ledger_key else {
            return Ok(None);
        };
        let key = crate::prelude::load_inline_or_file(key)?;
        let signer = key
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid ledger key: {}", e))?;
        Ok(Some(signer))
    }

    /// Initialize tracing/logging based on configuration
    ///
    /// Call this once early in main() before any logging calls.
    pub fn init_tracing(&self) {
        crate::logging::init_tracing(crate::logging::TracingConfig {
            verbose: self.verbose,
            debug: self.debug,
            quiet: self.quiet,
            silent: self.silent,
            format: self.log_format.clone(),
            log_file: self.log_file.clone(),
        });
    }
}

fn parse_optional_url(name: &str, value: Option<&str>) -> Result<Option<Url>> {
    value
        .map(|v| Url::parse(v).with_context(|| format!("Invalid {}: {}", name, v)))
        .transpose()
}

// ============================================================================
// Configuration Loading
// ============================================================================

/// Helper to load JSON from either a file path or inline JSON string
///
/// Accepts either:
/// - Inline JSON string (if it starts with '{' or '[')
/// - A file path (if the path exists)
/// - Anything else is handed to the JSON parser as-is
fn load_json_string(input: &str) -> Result<String> {
    if input.trim_start().starts_with('{') || input.trim_start().starts_with('[') {
        Ok(input.to_string())
    } else {
        let path = std::path::Path::new(input);
        if path.exists() {
            std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file '{}': {}", path.display(), e))
        } else {
            Ok(input.to_string())
        }
    }
}

/// Load global configuration from ConfigArgs
///
/// Precedence:
/// 1. CLI args / env vars (highest priority)
/// 2. --tokens
/// 3. --config
/// 4. Built-in defaults (lowest priority)
fn load_config(args: &ConfigArgs) -> Result<GlobalConfig> {
    let mut global = if let Some(config_input) = &args.config {
        let json_str = load_json_string(config_input)?;
        serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse global config JSON: {}", e))?
    } else {
        GlobalConfig::default()
    };

    if let Some(tokens_input) = &args.tokens {
        let json_str = load_json_string(tokens_input)?;
        global.tokens = serde_json::from_str(&json_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse tokens JSON: {}", e))?;
    }

    fn take<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
        if let Some(v) = value {
            *target = Some(v.clone());
        }
    }

    take(&mut global.port, &args.port);
    take(&mut global.connections, &args.connections);
    take(&mut global.pricing, &args.pricing);
    take(&mut global.pay_to, &args.pay_to);
    take(&mut global.payment_base_url, &args.payment_base_url);
    take(&mut global.qr_base_url, &args.qr_base_url);
    take(&mut global.verification_rpc_url, &args.verification_rpc_url);
    take(&mut global.ledger_rpc_url, &args.ledger_rpc_url);
    take(&mut global.ledger_contract, &args.ledger_contract);
    take(&mut global.ledger_key, &args.ledger_key);
    take(&mut global.ledger_chain_id, &args.ledger_chain_id);

    if let Some(mode) = args.payment_verification {
        global.payment_verification = mode;
    }
    if let Some(n) = args.min_confirmations {
        global.min_confirmations = n;
    }
    if let Some(blocks) = args.payment_max_age_blocks {
        global.payment_max_age_blocks = blocks;
    }
    if let Some(secs) = args.upstream_timeout_secs {
        global.upstream_timeout_secs = secs;
    }
    if let Some(secs) = args.ledger_timeout_secs {
        global.ledger_timeout_secs = secs;
    }
    if let Some(secs) = args.ledger_status_retention_secs {
        global.ledger_status_retention_secs = secs;
    }

    // Override logging settings from CLI args
    if args.verbose {
        global.verbose = true;
    }
    if args.debug {
        global.debug = true;
    }
    if args.quiet {
        global.quiet = true;
    }
    if args.silent {
        global.silent = true;
    }
    // Always take log_format from CLI (it has a default value)
    global.log_format = args.log_format.clone();
    take(&mut global.log_file, &args.log_file);

    Ok(global)
}
