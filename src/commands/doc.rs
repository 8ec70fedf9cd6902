//! Local document reads.

use clap::Args;
use eventsync::client::SyncClient;
use eventsync_core::SyncDocument;

use super::OutputFormat;

/// List documents stored on this device
#[derive(Args)]
pub struct ListCommand {
    /// Collection to list
    collection: String,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ListCommand {
    pub async fn run(&self, client: &SyncClient) -> Result<(), Box<dyn std::error::Error>> {
        let docs = client.get_documents(&self.collection).await?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&docs)?),
            OutputFormat::Text => {
                if docs.is_empty() {
                    println!("No documents in '{}'", self.collection);
                    return Ok(());
                }
                println!("{:<36}  {:>7}  {:<25}  PRIORITY", "ID", "VERSION", "MODIFIED");
                println!("{}", "-".repeat(84));
                for doc in &docs {
                    println!(
                        "{:<36}  {:>7}  {:<25}  {}",
                        doc.id,
                        doc.version(),
                        doc.last_modified().to_rfc3339(),
                        doc.metadata.retention_priority
                    );
                }
                println!("\nTotal: {} document(s)", docs.len());
            }
        }
        Ok(())
    }
}

/// Show one stored document
#[derive(Args)]
pub struct ShowCommand {
    collection: String,
    id: String,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ShowCommand {
    pub async fn run(&self, client: &SyncClient) -> Result<(), Box<dyn std::error::Error>> {
        let doc = client
            .get_document(&self.collection, &self.id)
            .await?
            .ok_or_else(|| format!("Document not found: {}/{}", self.collection, self.id))?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
            OutputFormat::Text => print_document(&doc)?,
        }
        Ok(())
    }
}

fn print_document(doc: &SyncDocument) -> Result<(), serde_json::Error> {
    let meta = &doc.metadata;
    println!("{}/{}", doc.collection, doc.id);
    println!("  version:  {}", meta.version);
    println!("  modified: {}", meta.last_modified.to_rfc3339());
    if let Some(synced) = meta.last_synced {
        println!("  synced:   {}", synced.to_rfc3339());
    }
    if let Some(expires) = meta.expires_at {
        println!("  expires:  {}", expires.to_rfc3339());
    }
    println!("  priority: {}", meta.retention_priority);
    println!();
    println!("{}", serde_json::to_string_pretty(&doc.data)?);
    Ok(())
}
