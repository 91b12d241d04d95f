use anyhow::Result;
use clap::{Parser, Subcommand};

use mcp402::{cli, config, webapp};

#[derive(Parser)]
#[command(name = "mcp402")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP gateway with x402 pay-per-call tools and on-chain work proofs")]
#[command(long_about = "\
MCP gateway with x402 pay-per-call tools and on-chain work proofs

mcp402 connects to remote MCP servers, either directly (HTTP or stdio) or
through proxy streams the remote opens, and exposes them over one HTTP API.
Priced tools answer 402 until a payment proof is supplied. Every execution
produces a work proof that is settled on a ledger contract in the background.

TYPICAL WORKFLOWS:

  Serve:
    mcp402 --connections connections.json --pricing pricing.json \\
           --pay-to 0x... serve

  Inspect a caller key:
    mcp402 identity alice@example.com

  Look up on-chain workload:
    mcp402 --ledger-rpc-url ... --ledger-contract 0x... workload 0x...

For more details on each command, use: mcp402 <command> --help
")]
struct Cli {
    /// Global configuration arguments
    #[command(flatten)]
    config: config::ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway HTTP server
    ///
    ///  - Establishes the configured direct connections and accepts proxy streams.
    ///
    ///  - Serves the API with Swagger UI at /swagger-ui.
    ///
    /// Example:
    ///
    ///  $ mcp402 serve
    ///
    ///  $ mcp402 --port 8080 serve --ready-file ./ready
    ///
    Serve(webapp::ServeArgs),

    /// Print the canonical caller key for an identifier
    ///
    /// Example:
    ///
    ///  $ mcp402 identity 0xAbC...
    ///
    Identity(cli::identity::IdentityArgs),

    /// Query the ledger contract for an address's workload
    Workload(cli::workload::WorkloadArgs),

    /// List all commands and subcommands (hidden, for tooling)
    #[command(hide = true)]
    ListCommands,
}

/// List all commands and their subcommands for tooling/scripting
///
/// Output format: `command` or `command:sub1 sub2 sub3`
fn list_commands() {
    use clap::CommandFactory;

    let cmd = Cli::command();

    for subcmd in cmd.get_subcommands() {
        let name = subcmd.get_name();
        if name == "help" || name == "list-commands" {
            continue;
        }

        let sub_names: Vec<&str> = subcmd
            .get_subcommands()
            .filter(|s| s.get_name() != "help")
            .map(|s| s.get_name())
            .collect();

        if sub_names.is_empty() {
            println!("{}", name);
        } else {
            println!("{}:{}", name, sub_names.join(" "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let global_config = config::GlobalConfig::from_args(&cli.config)?;
    global_config.init_tracing();

    tracing::debug!(version = %cli::version("mcp402"), "mcp402 starting");

    match cli.command {
        Commands::Serve(args) => webapp::run(args, &global_config).await?,
        Commands::Identity(args) => cli::identity::run(args)?,
        Commands::Workload(args) => cli::workload::run(args, &global_config).await?,
        Commands::ListCommands => list_commands(),
    }

    tracing::debug!("mcp402 shutting down");
    Ok(())
}
