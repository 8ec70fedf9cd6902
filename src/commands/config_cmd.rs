use clap::{Args, Subcommand};
use std::fmt::Display;

use super::OutputFormat;
use eventsync::config::{Config, ConfigValue};

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

fn show<T: Display>(name: &str, value: &ConfigValue<T>) {
    println!("{}: {}", name, value.value);
    println!("  source: {}", value.source);
}

fn show_optional(name: &str, value: &ConfigValue<Option<String>>, redact: bool) {
    let rendered = match &value.value {
        Some(v) if redact => super::redact(v),
        Some(v) => v.clone(),
        None => "(not set)".to_string(),
    };
    println!("{}: {}", name, rendered);
    println!("  source: {}", value.source);
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

                        show("api_url", &config.api_url);
                        show_optional("socket_url", &config.socket_url, false);
                        show_optional("auth_token", &config.auth_token, true);
                        show("db_name", &config.db_name);
                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        show("max_storage_size", &config.max_storage_size);
                        show("sync_interval", &config.sync_interval);
                        show("reconnect_delay", &config.reconnect_delay);
                        show("page_size", &config.page_size);
                        println!("collections: {}", config.collections.value.join(", "));
                        println!("  source: {}", config.collections.source);
                    }
                }
                Ok(())
            }
        }
    }
}
