//! Pull transport.

use async_trait::async_trait;
use eventsync_core::{HealthResponse, MeResponse, RawSyncResponse, SyncRequest};
use serde::de::DeserializeOwned;

use super::error::ClientError;

/// Fetches one page of pull results.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    async fn fetch(&self, request: &SyncRequest) -> Result<RawSyncResponse, ClientError>;
}

/// `GET {api_url}/sync` over HTTP with bearer auth.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(api_url: &str, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: build_http_url(api_url),
            auth_token,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&SyncRequest>,
    ) -> Result<T, ClientError> {
        let mut request = self.client.get(format!("{}{}", self.api_url, path));
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get("/health", None).await
    }

    pub async fn me(&self) -> Result<MeResponse, ClientError> {
        self.get("/me", None).await
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch(&self, request: &SyncRequest) -> Result<RawSyncResponse, ClientError> {
        tracing::debug!(
            collection = %request.collection,
            since = ?request.since,
            "Fetching sync page"
        );
        self.get("/sync", Some(request)).await
    }
}

/// Normalizes a server address to an `http(s)://` base without a trailing slash.
pub fn build_http_url(server_url: &str) -> String {
    let base = if let Some(rest) = server_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };
    base.trim_end_matches('/').to_string()
}

/// Builds the real-time channel URL, converting http(s) to ws(s).
pub fn build_ws_url(socket_url: &str, auth_token: Option<&str>) -> String {
    let base = if let Some(rest) = socket_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = socket_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !socket_url.starts_with("ws://") && !socket_url.starts_with("wss://") {
        format!("ws://{}", socket_url)
    } else {
        socket_url.to_string()
    };
    let base = base.trim_end_matches('/');
    let base = if base.ends_with("/ws") {
        base.to_string()
    } else {
        format!("{}/ws", base)
    };

    match auth_token {
        Some(token) => format!("{}?token={}", base, urlencoding::encode(token)),
        None => base,
    }
}
