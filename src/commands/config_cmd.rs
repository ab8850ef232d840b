use clap::{Args, Subcommand};

use splitsync::Config;

use super::OutputFormat;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!(
                            "user_id: {}",
                            config.user_id.value.as_deref().unwrap_or("(not set)")
                        );
                        println!("  source: {}", config.user_id.source);
                        println!();

                        let sync = &config.sync;
                        println!("sync:");
                        println!(
                            "  endpoint: {}",
                            sync.endpoint.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "  api_key: {}",
                            if sync.api_key.is_some() { "(set)" } else { "(not set)" }
                        );
                        println!(
                            "  realtime_url: {}",
                            sync.realtime_url().as_deref().unwrap_or("(none)")
                        );
                        println!("  poll_interval_secs: {}", sync.poll_interval_secs);
                        println!("  debounce_ms: {}", sync.debounce_ms);
                        println!("  max_retries: {}", sync.max_retries);
                        println!("  request_timeout_secs: {}", sync.request_timeout_secs);
                        println!(
                            "  connectivity_interval_secs: {}",
                            sync.connectivity_interval_secs
                        );
                    }
                }
                Ok(())
            }
        }
    }
}
