use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{
    CleanupCommand, ConfigCommand, ListCommand, ShowCommand, StatsCommand, StatusCommand,
    SyncCommand, WatchCommand,
};
use eventsync::client::SyncClient;
use eventsync::config::Config;

#[derive(Parser)]
#[command(name = "eventsync")]
#[command(version)]
#[command(about = "Offline-capable document sync client", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull collections from the server
    Sync(SyncCommand),

    /// Show sync configuration and server status
    Status(StatusCommand),

    /// Stay connected and print changes as they arrive
    Watch(WatchCommand),

    /// List documents stored on this device
    List(ListCommand),

    /// Show one stored document
    Show(ShowCommand),

    /// Show local storage usage
    Stats(StatsCommand),

    /// Remove expired documents and enforce the storage budget
    Cleanup(CleanupCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Client for one-shot commands: no background tasks.
async fn open_client(config: &Config) -> Result<SyncClient, Box<dyn std::error::Error>> {
    let mut client_config = config.client_config();
    client_config.socket_url = None;
    client_config.sync_interval = Duration::ZERO;

    let client = SyncClient::new(client_config);
    client.init().await?;
    Ok(client)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    let Some(command) = cli.command else {
        println!("Use --help to see available commands");
        return Ok(());
    };

    if let Commands::Config(cmd) = &command {
        return cmd.run(&config);
    }

    if let Commands::Watch(cmd) = &command {
        let client = SyncClient::new(config.client_config());
        cmd.run(&client, &config).await?;
        return Ok(());
    }

    let client = open_client(&config).await?;
    let result: Result<(), Box<dyn std::error::Error>> = match &command {
        Commands::Sync(cmd) => cmd.run(&client, &config).await.map_err(Into::into),
        Commands::Status(cmd) => cmd.run(&client, &config).await.map_err(Into::into),
        Commands::List(cmd) => cmd.run(&client).await,
        Commands::Show(cmd) => cmd.run(&client).await,
        Commands::Stats(cmd) => cmd.run(&client).await,
        Commands::Cleanup(cmd) => cmd.run(&client).await,
        Commands::Watch(_) | Commands::Config(_) => Ok(()),
    };
    client.disconnect().await;
    result
}
