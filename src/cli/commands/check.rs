//! check-config command - validate a configuration file and exit.

use crate::cli::args::CheckConfigArgs;
use crate::core::config::Config;
use anyhow::Result;

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    println!("{} is valid", args.config.display());
    Ok(())
}
