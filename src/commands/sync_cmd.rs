//! Runs one sync cycle against the configured server.

use clap::Args;

use splitsync::{Config, SyncEngine, SyncReport};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Retry transient failures with exponential backoff
    #[arg(long)]
    retry: bool,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let handle = SyncEngine::from_config(config)?.start();

        println!("Syncing with {}...", config.sync.endpoint()?);
        println!();

        let result = if self.retry {
            handle.retry_sync().await
        } else {
            handle.sync_now().await
        };
        handle.cleanup().await;

        print_report(&result?);
        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    println!("  ✓ uploaded   {}", report.uploaded);
    println!("  ✓ downloaded {}", report.downloaded);
    println!("  ✓ applied    {}", report.applied);

    if !report.server_errors.is_empty() {
        println!();
        println!("Server reported:");
        for problem in &report.server_errors {
            println!("  ✗ {}", problem);
        }
    }

    if !report.conflicts.is_empty() {
        println!();
        println!("Conflicts ({}):", report.conflicts.len());
        for conflict in &report.conflicts {
            println!("  {}", conflict);
        }
    }
    for unresolved in &report.unresolved {
        println!("  needs attention: {}", unresolved);
    }

    println!();
    if report.uploaded == 0 && report.applied == 0 {
        println!("Already up to date.");
    } else {
        println!("Sync complete.");
    }
}
