mod config_cmd;
mod queue_cmd;
mod status;
mod sync_cmd;
mod watch;

use clap::ValueEnum;

pub use config_cmd::ConfigCommand;
pub use queue_cmd::QueueCommand;
pub use status::StatusCommand;
pub use sync_cmd::SyncCommand;
pub use watch::WatchCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
