//! beacon CLI - command-line interface.
//!
//! Provides the binary entry points:
//! - `beacon start` - Start the broker
//! - `beacon check-config` - Validate a configuration file and exit

mod args;
pub mod commands;

pub use args::{CheckConfigArgs, Cli, Commands, StartArgs};
