use anyhow::Result;
use clap::Args;

use crate::identity::CallerIdentity;

#[derive(Args)]
pub struct IdentityArgs {
    /// Caller id to normalize (wallet address, email, handle, ...)
    pub raw: String,

    /// Print JSON instead of the bare key
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: IdentityArgs) -> Result<()> {
    let caller = CallerIdentity::new(args.raw);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&caller)?);
    } else {
        println!("{}", caller.canonical_uuid);
    }
    Ok(())
}
