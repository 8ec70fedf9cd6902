//! Token verification.
//!
//! Authentication mechanics are delegated to a [`TokenVerifier`]. The server
//! ships with [`ApiKeyStore`], a static key list loaded from the config file:
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "alice"
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Authenticated caller, added to request extensions after auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

/// Resolves a bearer token to a user.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// API key store - maps key -> AuthUser
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Load API keys from config file.
    ///
    /// A missing or unparsable file yields an empty store; every
    /// authenticated request will then fail.
    pub fn load(config_path: &Path) -> Self {
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(store) => {
                    tracing::info!("Loaded {} API key(s)", store.len());
                    store
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                Self::default()
            }
        }
    }

    /// Parses the YAML config body.
    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        let config: ConfigFile = serde_yaml::from_str(contents)?;
        let keys = config
            .api_keys
            .into_iter()
            .map(|entry| {
                (
                    entry.key,
                    AuthUser {
                        user_id: entry.user_id,
                    },
                )
            })
            .collect();
        Ok(Self { keys })
    }

    /// Adds a key at runtime.
    pub fn insert(&mut self, key: impl Into<String>, user_id: impl Into<String>) {
        self.keys.insert(
            key.into(),
            AuthUser {
                user_id: user_id.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TokenVerifier for ApiKeyStore {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        self.keys.get(token).cloned()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}
