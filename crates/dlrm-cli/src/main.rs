//! DLRM CLI - synthetic inference benchmarks and model shape dumps.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dlrm_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("dlrm=info".parse()?))
        .init();

    let cli = Cli::parse();

    info!("DLRM CLI starting...");

    match cli.command {
        Commands::Bench(cmd) => cmd.run().await?,
        Commands::Describe(cmd) => cmd.run().await?,
    }

    Ok(())
}
