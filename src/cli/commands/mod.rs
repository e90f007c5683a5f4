//! CLI command implementations.

mod config;
mod inspect;
mod invalidate;
mod purge;

pub use config::{run_config, ConfigArgs};
pub use inspect::{run_inspect, InspectArgs};
pub use invalidate::{run_invalidate, InvalidateArgs};
pub use purge::{run_purge, PurgeArgs};

use crate::core::config::{Config, ConfigOverrides};
use crate::core::time::system_clock;
use crate::store::IdempotencyStore;
use anyhow::{Context, Result};
use std::path::Path;

/// Load the configuration file (defaults when no path is given), apply
/// CLI overrides and validate the result.
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

/// Open the persistent store named by the configuration.
///
/// Maintenance commands are meaningless against the in-process backend.
pub async fn open_store(config: &Config) -> Result<IdempotencyStore> {
    if config.store.backend != "persistent" {
        anyhow::bail!(
            "this command needs the persistent backend; pass --storage-dir or set store.storage_dir"
        );
    }
    IdempotencyStore::open(config, system_clock()).await
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` takes precedence over the configured level.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}
