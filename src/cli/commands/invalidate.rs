//! Invalidate command implementation.

use super::open_store;
use crate::core::config::Config;
use crate::store::RecordKey;
use anyhow::Result;
use clap::Args;

/// Delete a completed record so the next request executes again.
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Owner identity.
    #[arg(long)]
    pub owner: String,
    /// Idempotency key.
    #[arg(long)]
    pub key: String,
}

/// Run the invalidate command.
pub async fn run_invalidate(args: InvalidateArgs, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let key = RecordKey::new(args.owner, args.key);
    if store.invalidate(&key).await? {
        println!("Invalidated {key}");
    } else {
        println!("No record for {key}");
    }
    Ok(())
}
