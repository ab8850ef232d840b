use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use splitsync::connectivity::{HttpProbe, Probe};
use splitsync::engine::last_sync;
use splitsync::state::{FileStateStore, StateStore};
use splitsync::{Config, PendingQueue};

use super::OutputFormat;

/// Show sync configuration, queue and server status
#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    configured: bool,
    endpoint: Option<String>,
    reachable: Option<bool>,
    last_sync_at: Option<DateTime<Utc>>,
    pending_count: usize,
    exhausted_count: usize,
    /// The queue file could not be written back
    persistence_degraded: bool,
}

impl StatusCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let state: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_dir()));
        let queue = PendingQueue::new(state.clone());

        let reachable = match config.sync.endpoint() {
            Ok(endpoint) => Some(HttpProbe::new(endpoint).check().await),
            Err(_) => None,
        };
        let report = StatusReport {
            configured: config.sync.is_configured(),
            endpoint: config.sync.endpoint.clone(),
            reachable,
            last_sync_at: last_sync(state.as_ref())?,
            pending_count: queue.size()?,
            exhausted_count: queue.exhausted()?.len(),
            persistence_degraded: queue.flush().is_err(),
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => print_text(&report),
        }
        Ok(())
    }
}

fn print_text(report: &StatusReport) {
    println!("Sync Status");
    println!("===========");
    println!();

    match &report.endpoint {
        Some(endpoint) => {
            println!("Server:    {}", endpoint);
            let status = match report.reachable {
                Some(true) => "✓ reachable",
                _ => "✗ unreachable",
            };
            println!("           {}", status);
        }
        None => {
            println!("Server:    Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  user_id: \"alice\"");
            println!("  sync:");
            println!("    endpoint: \"http://localhost:8080\"");
            println!("    api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  SPLITSYNC_USER_ID");
            println!("  SPLITSYNC_ENDPOINT");
            println!("  SPLITSYNC_API_KEY");
        }
    }
    println!();

    match report.last_sync_at {
        Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last sync: never"),
    }
    println!("Pending:   {}", report.pending_count);
    if report.exhausted_count > 0 {
        println!(
            "           {} change(s) stopped retrying, see `splitsync queue`",
            report.exhausted_count
        );
    }
    if report.persistence_degraded {
        println!("           ✗ queue cannot be saved, changes may be lost on restart");
    }
}
