//! Purge command implementation.

use super::open_store;
use crate::core::config::Config;
use anyhow::Result;
use clap::Args;

/// Remove expired records and lapsed locks.
#[derive(Args, Debug)]
pub struct PurgeArgs {}

/// Run the purge command.
pub async fn run_purge(_args: PurgeArgs, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.purge_expired().await?;
    println!(
        "Purged {} expired record(s) and {} lapsed lock(s)",
        stats.records, stats.locks
    );
    Ok(())
}
