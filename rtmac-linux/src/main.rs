use std::{error::Error, path::PathBuf};

use clap::Parser;
use rtmac_linux::{
    config::{Config, DEFAULT_CONFIG_PATH},
    network::UdpPort,
    observer,
    runtime::Runtime,
    tracing::{setup_tracing, LogLevel},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file to use
    #[clap(long = "config", short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config_file: PathBuf,

    /// Override the log level from the configuration file
    #[clap(long, short = 'l', value_enum)]
    loglevel: Option<LogLevel>,

    /// Only check the configuration file and exit
    #[clap(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = Config::from_file(&args.config_file).await?;
    setup_tracing(args.loglevel.unwrap_or(config.loglevel))?;

    if !config.check() {
        return Err(format!("invalid configuration in {}", args.config_file.display()).into());
    }
    if args.check {
        tracing::info!("Configuration in {} is valid", args.config_file.display());
        return Ok(());
    }

    let io = UdpPort::open(
        config.network.group,
        config.network.interface,
        config.station_address,
    )
    .await?;

    let (runtime, handle, mut upper) = Runtime::new(&config, io);
    let instance = tokio::spawn(runtime.run());

    let observer = observer::spawn(&config.observability, handle.clone()).await;

    // The daemon carries no upper layer, frames of other protocols end here
    tokio::spawn(async move {
        while let Some(envelope) = upper.recv().await {
            tracing::trace!(
                "Ignoring {:#06x} frame from {}",
                envelope.ethertype,
                envelope.source
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    observer.abort();
    handle.shutdown().await?;
    instance.await?;

    Ok(())
}
