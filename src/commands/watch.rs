//! Keeps an engine running and prints its status as it changes.

use clap::Args;

use splitsync::{Config, SyncEngine};

/// Run the sync engine in the foreground until interrupted
#[derive(Args)]
pub struct WatchCommand {
    /// Run one cycle immediately on start
    #[arg(long)]
    now: bool,
}

impl WatchCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let handle = SyncEngine::from_config(config)?.start();
        let mut status = handle.subscribe();

        println!("Watching {} (Ctrl-C to stop)", config.sync.endpoint()?);
        if self.now {
            handle.notify_remote_change();
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    println!("{}", current);
                    for conflict in &current.conflicts {
                        println!("  conflict: {}", conflict);
                    }
                }
            }
        }

        handle.cleanup().await;
        println!("Stopped.");
        Ok(())
    }
}
