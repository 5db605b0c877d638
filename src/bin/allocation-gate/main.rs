//! allocation-gate CLI entry point.

mod cli;

use allocation_gate::devnet::{DevChain, DevPipeline};
use allocation_gate::GatewayBuilder;
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let dev = cli.dev;
    let config = cli.into_config()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("allocation-gate v{}", env!("CARGO_PKG_VERSION"));

    let mut builder = GatewayBuilder::new(config);
    if dev {
        info!("Running on the in-process devnet");
        builder = builder.with_devnet(Arc::new(DevChain::new()), Arc::new(DevPipeline::new()));
    }

    let mut gateway = builder.build().await?;
    gateway.run().await?;

    info!("Goodbye!");
    Ok(())
}
