//! Inspect command implementation.

use super::open_store;
use crate::core::config::Config;
use crate::store::{IdempotencyRecord, KeyStatus, RecordKey};
use anyhow::Result;
use clap::{Args, Subcommand};

/// Inspect stored records and keys.
#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub command: InspectCommand,
}

/// Inspect subcommands.
#[derive(Subcommand, Debug)]
pub enum InspectCommand {
    /// List live completed records.
    Records {
        /// Only records of this owner.
        #[arg(long)]
        owner: Option<String>,
        /// Output format (text, json).
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the state of one key.
    Key {
        /// Owner identity.
        #[arg(long)]
        owner: String,
        /// Idempotency key.
        #[arg(long)]
        key: String,
    },
}

/// Run the inspect command.
pub async fn run_inspect(args: InspectArgs, config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    match args.command {
        InspectCommand::Records { owner, format } => {
            let records: Vec<IdempotencyRecord> = store
                .records()
                .await?
                .into_iter()
                .filter(|r| owner.as_deref().map_or(true, |o| r.owner == o))
                .collect();
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&records)?),
                _ => print_records(&records),
            }
        }
        InspectCommand::Key { owner, key } => {
            let record_key = RecordKey::new(owner, key);
            let status = store.status(&record_key).await?;
            println!("{record_key}: {}", status_label(status));
            match status {
                KeyStatus::Completed => {
                    if let Some(record) = store.get(&record_key).await {
                        println!("  status code: {}", record.response.head.status);
                        println!("  stream: {}", record.response.is_stream());
                        println!("  expires at: {}", record.expires_at.to_rfc3339());
                    }
                }
                KeyStatus::Pending => {
                    if let Some(entry) = store.locks().peek(&record_key.storage_name()).await? {
                        println!("  lease expires at: {}", entry.lease_expires_at.to_rfc3339());
                        println!("  renewals: {}", entry.renewals);
                    }
                }
                KeyStatus::Absent => {}
            }
        }
    }
    Ok(())
}

fn print_records(records: &[IdempotencyRecord]) {
    if records.is_empty() {
        println!("No live records");
        return;
    }
    println!("{:<24} {:<40} {:>6} {:<8} EXPIRES", "OWNER", "KEY", "STATUS", "KIND");
    for record in records {
        let kind = if record.response.is_stream() { "stream" } else { "single" };
        println!(
            "{:<24} {:<40} {:>6} {:<8} {}",
            record.owner,
            record.key,
            record.response.head.status,
            kind,
            record.expires_at.to_rfc3339()
        );
    }
    println!("{} record(s)", records.len());
}

fn status_label(status: KeyStatus) -> &'static str {
    match status {
        KeyStatus::Absent => "absent",
        KeyStatus::Pending => "pending",
        KeyStatus::Completed => "completed",
    }
}
