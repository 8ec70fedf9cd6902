//! Local storage inspection and maintenance.

use clap::Args;
use eventsync::client::SyncClient;

use super::OutputFormat;

/// Show local storage usage
#[derive(Args)]
pub struct StatsCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl StatsCommand {
    pub async fn run(&self, client: &SyncClient) -> Result<(), Box<dyn std::error::Error>> {
        let stats = client.get_storage_stats().await?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            OutputFormat::Text => {
                let percent = if stats.max_size == 0 {
                    0.0
                } else {
                    stats.total_size as f64 * 100.0 / stats.max_size as f64
                };
                println!("Storage");
                println!("=======\n");
                println!(
                    "Used:        {} / {} bytes ({:.1}%)",
                    stats.total_size, stats.max_size, percent
                );
                println!("Documents:   {}", stats.document_count);
                println!("Collections: {}", stats.collection_count);
                if let Some(oldest) = stats.oldest_document {
                    println!("Oldest:      {}", oldest.to_rfc3339());
                }
                if let Some(newest) = stats.newest_document {
                    println!("Newest:      {}", newest.to_rfc3339());
                }
            }
        }
        Ok(())
    }
}

/// Remove expired documents and enforce the storage budget
#[derive(Args)]
pub struct CleanupCommand {
    /// Only remove expired documents, skip eviction
    #[arg(long)]
    expired_only: bool,
}

impl CleanupCommand {
    pub async fn run(&self, client: &SyncClient) -> Result<(), Box<dyn std::error::Error>> {
        let expired = client.cleanup_expired().await?;
        println!("Removed {} expired document(s)", expired);

        if !self.expired_only {
            let evicted = client.ensure_storage_space().await?;
            if evicted > 0 {
                println!("Evicted {} document(s) to stay within budget", evicted);
            } else {
                println!("Storage within budget");
            }
        }
        Ok(())
    }
}
