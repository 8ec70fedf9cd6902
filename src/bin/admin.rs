//! eventsync Admin CLI
//!
//! Administration tool for the server database: group memberships,
//! group links, direct grants, documents and tombstones.
//!
//! # Usage
//!
//! ```bash
//! eventsync-admin group add alice staff
//! eventsync-admin link staff venue-42 --level edit
//! eventsync-admin grant events --user bob --action read
//! eventsync-admin doc put events e1 '{"title":"Opening"}' --group venue-42
//! eventsync-admin tombstones gc --before 2026-01-01T00:00:00Z
//! ```
//!
//! Writes made here reach devices on their next pull; live sessions belong
//! to the server process.
//!
//! # Environment Variables
//!
//! - `EVENTSYNC_DATA_DIR`: Directory where the server stores data (default: ~/.local/share/eventsync-server)

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use eventsync::server::{ServerConfig, SyncEngine};
use eventsync_core::{
    Action, GroupPermission, Permission, PermissionLevel, PermissionScope, Principal,
    RetentionPriority,
};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "eventsync-admin")]
#[command(version)]
#[command(about = "eventsync server administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage user-group memberships
    Group(GroupCommand),

    /// Link a user-group to a document-group
    Link {
        user_group: String,
        document_group: String,
        #[arg(long, short, default_value = "view")]
        level: PermissionLevel,
    },

    /// Remove a group link
    Unlink {
        user_group: String,
        document_group: String,
    },

    /// Grant actions on a collection (or one item) directly
    Grant {
        collection: String,
        /// Grant to this user
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        user: Option<String>,
        /// Grant to this group
        #[arg(long)]
        group: Option<String>,
        /// Restrict the grant to one item
        #[arg(long)]
        item: Option<String>,
        /// Action to grant (can be repeated)
        #[arg(long = "action", value_name = "ACTION", required = true)]
        actions: Vec<Action>,
    },

    /// Remove a direct grant by id
    Revoke { id: i64 },

    /// List links and direct grants
    Permissions,

    /// Manage documents
    Doc(DocCommand),

    /// Manage tombstones
    Tombstones(TombstoneCommand),
}

#[derive(Args)]
struct GroupCommand {
    #[command(subcommand)]
    command: GroupSubcommand,
}

#[derive(Subcommand)]
enum GroupSubcommand {
    /// Add a user to a group
    Add { user: String, group: String },
    /// Remove a user from a group
    Remove { user: String, group: String },
    /// List all memberships
    List,
}

#[derive(Args)]
struct DocCommand {
    #[command(subcommand)]
    command: DocSubcommand,
}

#[derive(Subcommand)]
enum DocSubcommand {
    /// Create or update a document
    Put {
        collection: String,
        id: String,
        /// Document body as JSON
        data: String,
        /// Document-group tag (can be repeated; replaces existing tags)
        #[arg(long = "group", value_name = "GROUP")]
        groups: Vec<String>,
        #[arg(long, default_value = "medium")]
        priority: RetentionPriority,
        /// Expiry as an RFC 3339 timestamp
        #[arg(long)]
        expires: Option<DateTime<Utc>>,
    },
    /// Delete a document, leaving a tombstone
    Delete {
        collection: String,
        id: String,
        /// Actor recorded on the tombstone
        #[arg(long, default_value = "admin")]
        by: String,
    },
    /// Delete every document in a collection
    Clear {
        collection: String,
        #[arg(long, default_value = "admin")]
        by: String,
    },
}

#[derive(Args)]
struct TombstoneCommand {
    #[command(subcommand)]
    command: TombstoneSubcommand,
}

#[derive(Subcommand)]
enum TombstoneSubcommand {
    /// Drop tombstones deleted before a timestamp
    Gc {
        #[arg(long)]
        before: DateTime<Utc>,
    },
}

// ============================================================================
// Commands
// ============================================================================

async fn group(engine: &SyncEngine, cmd: GroupSubcommand) -> Result<(), Box<dyn std::error::Error>> {
    let store = engine.store();
    match cmd {
        GroupSubcommand::Add { user, group } => {
            store.add_user_to_group(&user, &group).await?;
            println!("Added {} to group {}", user, group);
        }
        GroupSubcommand::Remove { user, group } => {
            if !store.remove_user_from_group(&user, &group).await? {
                return Err(format!("{} is not in group {}", user, group).into());
            }
            println!("Removed {} from group {}", user, group);
        }
        GroupSubcommand::List => {
            let memberships = store.memberships().await?;
            if memberships.is_empty() {
                println!("No memberships.");
                return Ok(());
            }

            println!("{:<40} {:<30}", "USER", "GROUP");
            println!("{}", "-".repeat(70));
            for (user, group) in &memberships {
                println!("{:<40} {:<30}", user, group);
            }
            println!();
            println!("Total: {} membership(s)", memberships.len());
        }
    }
    Ok(())
}

async fn list_permissions(engine: &SyncEngine) -> Result<(), Box<dyn std::error::Error>> {
    let store = engine.store();

    let links = store.group_permissions().await?;
    println!("Group links");
    println!("{}", "-".repeat(70));
    if links.is_empty() {
        println!("(none)");
    }
    for link in &links {
        println!(
            "{:<30} -> {:<30} {}",
            link.user_group_id, link.document_group_id, link.level
        );
    }

    println!();
    println!("Direct grants");
    println!("{}", "-".repeat(70));
    let grants = store.permission_entries().await?;
    if grants.is_empty() {
        println!("(none)");
    }
    for (id, permission) in &grants {
        let principal = match &permission.principal {
            Principal::User(u) => format!("user:{}", u),
            Principal::Group(g) => format!("group:{}", g),
        };
        let target = match (permission.scope, &permission.item_id) {
            (PermissionScope::Item, Some(item)) => format!("{}/{}", permission.collection, item),
            _ => format!("{}/*", permission.collection),
        };
        let actions: Vec<String> = permission.actions.iter().map(|a| a.to_string()).collect();
        println!(
            "#{:<5} {:<25} {:<30} {}",
            id,
            principal,
            target,
            actions.join(",")
        );
    }
    Ok(())
}

async fn doc(engine: &SyncEngine, cmd: DocSubcommand) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        DocSubcommand::Put {
            collection,
            id,
            data,
            groups,
            priority,
            expires,
        } => {
            let data: serde_json::Value = serde_json::from_str(&data)?;
            let groups = (!groups.is_empty()).then_some(groups.as_slice());
            let doc = engine
                .publish(&collection, &id, data, groups, priority, expires)
                .await?;
            println!("Stored {}/{} (version {})", doc.collection, doc.id, doc.version());
        }
        DocSubcommand::Delete { collection, id, by } => {
            match engine.retract(&collection, &id, &by).await? {
                Some(record) => println!(
                    "Deleted {}/{} (tombstone version {})",
                    record.collection, record.id, record.version
                ),
                None => return Err(format!("Document not found: {}/{}", collection, id).into()),
            }
        }
        DocSubcommand::Clear { collection, by } => {
            let records = engine.clear(&collection, &by).await?;
            println!("Deleted {} document(s) from {}", records.len(), collection);
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env();
    let engine = SyncEngine::open(&config.database_path()).await?;

    match cli.command {
        Commands::Group(cmd) => group(&engine, cmd.command).await?,
        Commands::Link {
            user_group,
            document_group,
            level,
        } => {
            engine
                .store()
                .link_groups(&GroupPermission::new(&*user_group, &*document_group, level))
                .await?;
            println!("Linked {} -> {} ({})", user_group, document_group, level);
        }
        Commands::Unlink {
            user_group,
            document_group,
        } => {
            if !engine
                .store()
                .unlink_groups(&user_group, &document_group)
                .await?
            {
                return Err(format!("No link {} -> {}", user_group, document_group).into());
            }
            println!("Unlinked {} -> {}", user_group, document_group);
        }
        Commands::Grant {
            collection,
            user,
            group,
            item,
            actions,
        } => {
            let principal = match (user, group) {
                (Some(user), _) => Principal::User(user),
                (None, Some(group)) => Principal::Group(group),
                (None, None) => return Err("--user or --group is required".into()),
            };
            let permission = match item {
                Some(item) => Permission::for_item(principal, collection, item, actions),
                None => Permission::for_collection(principal, collection, actions),
            };
            let id = engine.store().grant(&permission).await?;
            println!("Granted permission #{}", id);
        }
        Commands::Revoke { id } => {
            if !engine.store().revoke(id).await? {
                return Err(format!("Permission #{} not found", id).into());
            }
            println!("Revoked permission #{}", id);
        }
        Commands::Permissions => list_permissions(&engine).await?,
        Commands::Doc(cmd) => doc(&engine, cmd.command).await?,
        Commands::Tombstones(cmd) => match cmd.command {
            TombstoneSubcommand::Gc { before } => {
                let removed = engine.store().gc_tombstones(before).await?;
                println!("Removed {} tombstone(s)", removed);
            }
        },
    }

    Ok(())
}
