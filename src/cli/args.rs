//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// beacon - MQTT 3.1/3.1.1/5.0 broker.
#[derive(Parser)]
#[command(name = "beacon")]
#[command(version)]
#[command(about = "beacon MQTT broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Validate a configuration file and exit
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/beacon.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to the TOML configuration file
    pub config: PathBuf,
}
