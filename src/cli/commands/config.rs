//! Config command implementation.

use super::load_config;
use crate::core::config::ConfigOverrides;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the effective configuration, defaults included.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(
    args: ConfigArgs,
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(path, overrides),
        ConfigCommand::Show { format } => show_config(path, overrides, &format),
    }
}

fn validate_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(path, overrides)?;
    println!("✓ Configuration is valid");
    println!("  store backend: {}", config.store.backend);
    println!(
        "  lease: {}ms, heartbeat: {}ms",
        config.lock.lease_ms, config.lock.heartbeat_interval_ms
    );
    println!(
        "  protected: {} paths, methods {}",
        config.coordinator.protected_paths.len(),
        config.coordinator.protected_methods.join(",")
    );
    Ok(())
}

fn show_config(path: Option<&Path>, overrides: &ConfigOverrides, format: &str) -> Result<()> {
    let config = load_config(path, overrides)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("unknown format: {other} (expected toml or json)"),
    }
    Ok(())
}
