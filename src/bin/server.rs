//! eventsync server
//!
//! Serves pull sync over HTTP and pushes permitted changes to connected
//! devices over WebSocket.
//!
//! # Configuration
//!
//! Environment variables:
//! - `EVENTSYNC_PORT`: Port to listen on (default: 8080)
//! - `EVENTSYNC_DATA_DIR`: Directory for `server.db` (default: ~/.local/share/eventsync-server)
//! - `EVENTSYNC_CONFIG`: Path to config file (default: ~/.config/eventsync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//! ```
//!
//! Group memberships, group links and permissions live in the database and
//! are managed with `eventsync-admin`.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check (no auth)
//! - `GET /me`: Current user and groups (auth required)
//! - `GET /sync`: Pull sync (anonymous callers see nothing)
//! - `GET /ws?token=...`: Real-time events

use eventsync::server::{router, ApiKeyStore, ServerConfig, SyncEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env();

    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
        format!(
            "Failed to create data directory {}: {}",
            config.data_dir.display(),
            e
        )
    })?;

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));
    let engine = SyncEngine::open(&config.database_path()).await?;
    let app = router(engine.app_state(api_keys));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
