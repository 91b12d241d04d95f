// Library interface for mcp402
// The binary and the tests import the modules from here

pub mod cli;
pub mod config;
pub mod error;
pub mod eth;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod mcp;
pub mod prelude;
pub mod webapp;
pub mod x402;
