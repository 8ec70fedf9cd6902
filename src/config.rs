//! Device CLI configuration.
//!
//! Loaded with priority: env vars > config file > defaults. Every value
//! remembers where it came from so `eventsync config` can show it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::client::{
    ClientConfig, DEFAULT_DB_NAME, DEFAULT_MAX_STORAGE_SIZE, DEFAULT_RECONNECT_DELAY,
    DEFAULT_SYNC_INTERVAL,
};
use eventsync_core::DEFAULT_PAGE_LIMIT;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Source of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    fn default(value: T) -> Self {
        Self::new(value, ConfigSource::Default)
    }

    fn set(&mut self, value: T, source: ConfigSource) {
        self.value = value;
        self.source = source;
    }
}

/// Device configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub api_url: ConfigValue<String>,
    pub socket_url: ConfigValue<Option<String>>,
    pub auth_token: ConfigValue<Option<String>>,
    pub db_name: ConfigValue<String>,
    pub data_dir: ConfigValue<PathBuf>,
    pub max_storage_size: ConfigValue<u64>,
    /// Seconds between periodic pulls; 0 disables them.
    pub sync_interval: ConfigValue<u64>,
    /// Milliseconds before reconnecting the real-time channel.
    pub reconnect_delay: ConfigValue<u64>,
    pub page_size: ConfigValue<usize>,
    /// Collections `eventsync sync` pulls by default.
    pub collections: ConfigValue<Vec<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    api_url: Option<String>,
    socket_url: Option<String>,
    auth_token: Option<String>,
    db_name: Option<String>,
    data_dir: Option<PathBuf>,
    max_storage_size: Option<u64>,
    sync_interval: Option<u64>,
    reconnect_delay: Option<u64>,
    page_size: Option<usize>,
    collections: Option<Vec<String>>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading variables through `lookup`.
    pub fn load_with(
        config_path: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self {
            api_url: ConfigValue::default(DEFAULT_API_URL.to_string()),
            socket_url: ConfigValue::default(None),
            auth_token: ConfigValue::default(None),
            db_name: ConfigValue::default(DEFAULT_DB_NAME.to_string()),
            data_dir: ConfigValue::default(Self::default_data_dir()),
            max_storage_size: ConfigValue::default(DEFAULT_MAX_STORAGE_SIZE),
            sync_interval: ConfigValue::default(DEFAULT_SYNC_INTERVAL.as_secs()),
            reconnect_delay: ConfigValue::default(DEFAULT_RECONNECT_DELAY.as_millis() as u64),
            page_size: ConfigValue::default(DEFAULT_PAGE_LIMIT),
            collections: ConfigValue::default(Vec::new()),
            config_file: None,
        };

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config.apply_file(file, &path);
            config.config_file = Some(path);
        }

        // Apply environment variable overrides
        let env = ConfigSource::Environment;
        if let Some(url) = lookup("EVENTSYNC_API_URL") {
            config.api_url.set(url, env);
        }
        if let Some(url) = lookup("EVENTSYNC_SOCKET_URL") {
            config.socket_url.set(Some(url), env);
        }
        if let Some(token) = lookup("EVENTSYNC_AUTH_TOKEN") {
            config.auth_token.set(Some(token), env);
        }
        if let Some(name) = lookup("EVENTSYNC_DB_NAME") {
            config.db_name.set(name, env);
        }
        if let Some(dir) = lookup("EVENTSYNC_DATA_DIR") {
            config.data_dir.set(PathBuf::from(dir), env);
        }

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile, path: &std::path::Path) {
        let src = ConfigSource::File;
        if let Some(url) = file.api_url {
            self.api_url.set(url, src);
        }
        if let Some(url) = file.socket_url {
            self.socket_url.set(Some(url), src);
        }
        if let Some(token) = file.auth_token {
            self.auth_token.set(Some(token), src);
        }
        if let Some(name) = file.db_name {
            self.db_name.set(name, src);
        }
        if let Some(dir) = file.data_dir {
            // Resolve relative paths against config file's directory
            let resolved = if dir.is_relative() {
                path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
            } else {
                dir
            };
            self.data_dir.set(resolved, src);
        }
        if let Some(size) = file.max_storage_size {
            self.max_storage_size.set(size, src);
        }
        if let Some(secs) = file.sync_interval {
            self.sync_interval.set(secs, src);
        }
        if let Some(ms) = file.reconnect_delay {
            self.reconnect_delay.set(ms, src);
        }
        if let Some(size) = file.page_size {
            self.page_size.set(size, src);
        }
        if let Some(collections) = file.collections {
            self.collections.set(collections, src);
        }
    }

    /// Runtime client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_url: self.api_url.value.clone(),
            socket_url: self.socket_url.value.clone(),
            auth_token: self.auth_token.value.clone(),
            db_name: self.db_name.value.clone(),
            data_dir: self.data_dir.value.clone(),
            max_storage_size: self.max_storage_size.value,
            sync_interval: Duration::from_secs(self.sync_interval.value),
            reconnect_delay: Duration::from_millis(self.reconnect_delay.value),
            page_size: self.page_size.value,
        }
    }

    /// Local database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir
            .value
            .join(format!("{}.db", self.db_name.value))
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/eventsync/
    /// - macOS: ~/Library/Application Support/eventsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eventsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/eventsync/
    /// - macOS: ~/Library/Application Support/eventsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eventsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    ReadError(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, #[source] serde_yaml::Error),
}
