mod api;
mod cli;
mod config;
mod error;
mod persistence;
mod scheduler;
mod server;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::CliArgs::parse();

    // Load configuration, then let the command line override it
    let mut config = config::ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    if let Some(path) = &args.write_config {
        config
            .save(path)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    config.validate()?;

    let _guard = telemetry::init_tracing(
        config.log_dir.as_deref(),
        &config.log_file,
        &config.log_level,
    )?;

    info!(
        "Starting traffic server v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );

    let server = server::TrafficServer::new(config).await?;
    server.run().await?;

    Ok(())
}
