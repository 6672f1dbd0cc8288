//! beacon - CLI entrypoint.
//!
//! Usage:
//!   beacon start --config config/beacon.toml
//!   beacon check-config <path>

use anyhow::Result;
use beacon::cli::commands::{run_check_config, run_start};
use beacon::cli::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
    }
}
