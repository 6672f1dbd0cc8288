//! Start command - launches the beacon broker.

use crate::broker::Broker;
use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    telemetry::init_tracing(&config.telemetry.log_level)?;

    let broker = Broker::new(config);
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                broker.shutdown();
            }
        });
    }
    broker.run().await
}
