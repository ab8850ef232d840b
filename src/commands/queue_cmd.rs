use clap::Args;
use std::sync::Arc;

use splitsync::models::MAX_RETRY_COUNT;
use splitsync::state::FileStateStore;
use splitsync::{Config, PendingQueue};

use super::OutputFormat;

/// List changes waiting to be uploaded
#[derive(Args)]
pub struct QueueCommand {
    /// Only show changes that stopped retrying
    #[arg(long)]
    exhausted: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl QueueCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let queue = PendingQueue::new(Arc::new(FileStateStore::new(config.state_dir())));
        let changes = if self.exhausted {
            queue.exhausted()?
        } else {
            queue.drain()?
        };

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&changes)?);
            }
            OutputFormat::Text => {
                if changes.is_empty() {
                    println!("No pending changes.");
                    return Ok(());
                }
                println!(
                    "{:<36}  {:<6}  {:<10}  {:<36}  {:>7}  QUEUED",
                    "ID", "KIND", "TYPE", "ENTITY", "RETRIES"
                );
                for change in &changes {
                    let retries = if change.is_exhausted() {
                        format!("{}!", MAX_RETRY_COUNT)
                    } else {
                        change.retry_count.to_string()
                    };
                    println!(
                        "{:<36}  {:<6}  {:<10}  {:<36}  {:>7}  {}",
                        change.id.to_string(),
                        change.kind.to_string(),
                        change.entity_type.to_string(),
                        change.entity_id,
                        retries,
                        change.enqueued_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
                println!("{} change(s)", changes.len());
            }
        }
        Ok(())
    }
}
