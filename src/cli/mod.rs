//! Command-line interface.
//!
//! Maintenance CLI for idemgate stores.

pub mod commands;

use clap::{Parser, Subcommand};

/// idemgate - idempotent request coordination.
#[derive(Parser, Debug)]
#[command(name = "idemgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Store directory; selects the persistent backend.
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Overrides carried by the global flags.
    pub fn overrides(&self) -> crate::core::config::ConfigOverrides {
        crate::core::config::ConfigOverrides {
            log_level: self.log_level.clone(),
            storage_dir: self.storage_dir.clone(),
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Inspect stored records and keys.
    Inspect(commands::InspectArgs),
    /// Remove expired records and lapsed locks.
    Purge(commands::PurgeArgs),
    /// Delete a completed record.
    Invalidate(commands::InvalidateArgs),
}
