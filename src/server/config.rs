//! Server configuration.
//!
//! Environment variables:
//! - `EVENTSYNC_PORT`: Port to listen on (default: 8080)
//! - `EVENTSYNC_DATA_DIR`: Directory for the server database (default: ~/.local/share/eventsync-server)
//! - `EVENTSYNC_CONFIG`: Path to config file (default: ~/.config/eventsync-server/config.yaml)

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Directory holding `server.db`
    pub data_dir: PathBuf,
    /// Path to config file (API keys)
    pub config_path: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("EVENTSYNC_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let data_dir = lookup("EVENTSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("eventsync-server")
            });

        let config_path = lookup("EVENTSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("eventsync-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("server.db")
    }
}
