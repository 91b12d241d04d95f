use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use crate::eth::{parse_address, EthRpc};
use crate::identity::CallerIdentity;
use crate::ledger::{EvmWorkLedger, WorkLedger};

#[derive(Args)]
pub struct WorkloadArgs {
    /// EVM address to look up on the ledger contract
    pub address: String,
}

/// Query `getUserWorkload` on the configured ledger contract
pub async fn run(args: WorkloadArgs, config: &crate::config::GlobalConfig) -> Result<()> {
    let address = parse_address(&args.address)
        .ok_or_else(|| anyhow::anyhow!("Not an EVM address: {}", args.address))?;

    let ledger = config.ledger()?.ok_or_else(|| {
        anyhow::anyhow!("No ledger configured. Specify --ledger-rpc-url, --ledger-contract, --ledger-chain-id and --ledger-key")
    })?;
    let ledger = EvmWorkLedger::new(EthRpc::new(ledger.rpc_url), ledger.signer, ledger.settings);

    let workload = ledger
        .user_workload(address)
        .await
        .with_context(|| format!("getUserWorkload failed on {}", ledger.describe()))?;

    let output = json!({
        "address": address,
        "caller": CallerIdentity::new(args.address.as_str()),
        "ledger": ledger.describe(),
        "workload": workload,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
