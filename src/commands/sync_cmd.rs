//! Sync CLI commands for synchronizing with the server.

use chrono::{DateTime, Utc};
use clap::Args;
use eventsync::client::{ClientError, SyncClient, SyncEvent, Subscriber};
use eventsync::config::Config;

/// Pull collections from the server into local storage
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Collections to pull (defaults to the configured list)
    collections: Vec<String>,

    /// Pull changes since this RFC 3339 timestamp instead of the stored cursor
    #[arg(long, conflicts_with = "full")]
    since: Option<DateTime<Utc>>,

    /// Ignore stored cursors and take a full snapshot
    #[arg(long)]
    full: bool,
}

impl SyncCommand {
    pub async fn run(&self, client: &SyncClient, config: &Config) -> Result<(), ClientError> {
        let collections = pick_collections(&self.collections, config);
        if collections.is_empty() {
            println!("No collections given and none configured.");
            return Ok(());
        }

        println!("Syncing with {}...", config.api_url.value);
        println!();

        let since = if self.full {
            DateTime::from_timestamp(0, 0)
        } else {
            self.since
        };

        for collection in &collections {
            let report = client.sync_collection(collection, since).await?;
            let status = if report.applied + report.deleted > 0 {
                "✓ updated"
            } else {
                "✓ up to date"
            };
            println!(
                "  {} {} ({} applied, {} deleted, {} page{})",
                status,
                collection,
                report.applied,
                report.deleted,
                report.pages,
                if report.pages == 1 { "" } else { "s" }
            );
            if report.skipped > 0 {
                println!("    skipped {} invalid record(s)", report.skipped);
            }
        }

        println!();
        println!("Sync complete.");
        Ok(())
    }
}

/// Show sync configuration and server status
#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, client: &SyncClient, config: &Config) -> Result<(), ClientError> {
        println!("Sync Configuration");
        println!("==================");
        println!();
        println!("Client:    v{}", eventsync_core::version());
        println!("Server:    {}", config.api_url.value);
        match &config.socket_url.value {
            Some(url) => println!("Real-time: {}", url),
            None => println!("Real-time: disabled"),
        }
        match &config.auth_token.value {
            Some(token) => println!("Token:     {}", super::redact(token)),
            None => println!("Token:     (anonymous)"),
        }
        println!();

        print!("Server status: ");
        match client.transport().health().await {
            Ok(health) => println!("✓ {} (v{})", health.status, health.version),
            Err(e) if e.is_connectivity() => println!("✗ unreachable"),
            Err(e) => println!("✗ error: {}", e),
        }

        if config.auth_token.value.is_some() {
            match client.transport().me().await {
                Ok(me) => println!("Signed in as {} (groups: {})", me.user_id, me.group_ids.join(", ")),
                Err(e) => println!("Identity check failed: {}", e),
            }
        }

        let local = client.local_collections().await?;
        if !local.is_empty() {
            println!();
            println!("Local collections: {}", local.join(", "));
        }
        Ok(())
    }
}

/// Stay connected and print changes as they arrive
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Collections to watch (defaults to the configured list)
    collections: Vec<String>,
}

impl WatchCommand {
    pub async fn run(&self, client: &SyncClient, config: &Config) -> Result<(), ClientError> {
        let collections = pick_collections(&self.collections, config);
        if collections.is_empty() {
            println!("No collections given and none configured.");
            return Ok(());
        }

        for collection in &collections {
            let name = collection.clone();
            let deleted_in = collection.clone();
            let failed_in = collection.clone();
            client.subscribe(
                collection,
                Subscriber::new()
                    .on_update(move |doc| {
                        println!("[{}] updated {} (v{})", name, doc.id, doc.version())
                    })
                    .on_delete(move |id| println!("[{}] deleted {}", deleted_in, id))
                    .on_error(move |e| eprintln!("[{}] error: {}", failed_in, e)),
            );
        }

        let mut events = client.events();
        client.init().await?;
        println!("Watching {} (Ctrl-C to stop)", collections.join(", "));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SyncEvent::Complete { collection }) => {
                        tracing::debug!("Synced {}", collection);
                    }
                    Ok(SyncEvent::Error { collection, message }) => {
                        eprintln!("[{}] sync failed: {}", collection, message);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.disconnect().await;
        Ok(())
    }
}

fn pick_collections(given: &[String], config: &Config) -> Vec<String> {
    if given.is_empty() {
        config.collections.value.clone()
    } else {
        given.to_vec()
    }
}
