//! x402-node CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, LogFormat};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use x402_node::NodeBuilder;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    info!("x402-node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = cli.into_config()?;

    // Build and run the node
    let mut node = NodeBuilder::new(config).build().await?;

    // Run until shutdown
    node.run().await?;

    info!("Goodbye!");
    Ok(())
}
