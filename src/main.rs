//! idemgate - maintenance CLI entrypoint.
//!
//! Usage:
//!   idemgate config validate --config idemgate.toml
//!   idemgate config show --format json
//!   idemgate inspect records --storage-dir /var/lib/idemgate
//!   idemgate inspect key --owner u1 --key abc123
//!   idemgate purge --storage-dir /var/lib/idemgate
//!   idemgate invalidate --owner u1 --key abc123

use anyhow::Result;
use clap::Parser;
use idemgate::cli::commands::{
    init_tracing, load_config, run_config, run_inspect, run_invalidate, run_purge,
};
use idemgate::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();
    let config_path = cli.config.as_ref().map(PathBuf::from);

    if let Commands::Config(args) = cli.command {
        return run_config(args, config_path.as_deref(), &overrides);
    }

    let config = load_config(config_path.as_deref(), &overrides)?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Config(_) => Ok(()),
        Commands::Inspect(args) => run_inspect(args, &config).await,
        Commands::Purge(args) => run_purge(args, &config).await,
        Commands::Invalidate(args) => run_invalidate(args, &config).await,
    }
}
