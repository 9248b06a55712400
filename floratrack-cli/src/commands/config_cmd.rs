use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::OutputFormat;
use crate::config::Config;

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

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# flora configuration

# Directory for the local store (default: ~/.local/share/flora)
# data_dir: ~/.local/share/flora

sync:
  # server_url: "http://localhost:8080"
  # api_key: "your-secret-key-here"

  # Sync after writes and keep 'flora watch' syncing
  auto_sync: false

  # request_timeout_secs: 15
  # retry:
  #   base_delay_ms: 1000
  #   max_delay_ms: 30000
  #   jitter_ms: 250
  #   max_attempts: 5
  # success_linger_ms: 3000
  # stability_window_ms: 2000
  # probe_interval_secs: 10
  # periodic_interval_secs: 300
"#;

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
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

                        let sync = &config.sync;
                        let settings = sync.settings();
                        println!(
                            "sync.server_url: {}",
                            sync.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "sync.api_key: {}",
                            if sync.api_key.is_some() {
                                "(set)"
                            } else {
                                "(not set)"
                            }
                        );
                        println!("sync.auto_sync: {}", sync.auto_sync);
                        println!(
                            "sync.request_timeout: {}s",
                            sync.request_timeout().as_secs()
                        );
                        println!(
                            "sync.retry: {} attempts, {}ms base, {}ms cap",
                            settings.retry.max_attempts,
                            settings.retry.base_delay.as_millis(),
                            settings.retry.max_delay.as_millis()
                        );
                        match settings.periodic_interval {
                            Some(interval) => {
                                println!("sync.periodic_interval: {}s", interval.as_secs())
                            }
                            None => println!("sync.periodic_interval: disabled"),
                        }
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'flora config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}
