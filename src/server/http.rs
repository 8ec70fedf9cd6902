//! HTTP and WebSocket surface.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /me`: Returns current user info (auth required)
//! - `GET /sync`: Pull-sync (auth optional, anonymous callers see nothing)
//! - `GET /ws?token=...`: Real-time event channel (token required)

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use eventsync_core::{HealthResponse, MeResponse, SyncRequest, SyncResponse};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::auth::{bearer_token, AuthUser, TokenVerifier};
use super::broadcast::Broadcaster;
use super::store::ServerStoreError;
use super::sync::{SyncService, SyncServiceError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sync: SyncService,
    pub broadcaster: Arc<Broadcaster>,
    pub verifier: Arc<dyn TokenVerifier>,
}

// ============================================================================
// Errors
// ============================================================================

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: error.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for SyncServiceError {
    fn into_response(self) -> Response {
        match self {
            SyncServiceError::InvalidRequest(e) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
            }
            SyncServiceError::Store(e) => e.into_response(),
        }
    }
}

impl IntoResponse for ServerStoreError {
    fn into_response(self) -> Response {
        tracing::error!("Store error: {}", self);
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authentication middleware: rejects requests without a valid token.
async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match bearer_token(h) {
            Some(token) => token,
            None => {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "invalid_auth",
                    "Authorization header must use Bearer scheme",
                )
            }
        },
        None => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "missing_auth",
                "Authorization header required",
            )
        }
    };

    match state.verifier.verify(api_key) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => error_response(StatusCode::UNAUTHORIZED, "invalid_key", "Invalid API key"),
    }
}

/// Caller of a route with optional auth; `None` when anonymous.
#[derive(Debug, Clone)]
struct Caller(Option<AuthUser>);

/// Attaches the caller if the token is valid; otherwise passes through
/// anonymously.
async fn optional_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let user = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| state.verifier.verify(token));

    request.extensions_mut().insert(Caller(user));
    next.run(request).await
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Get current user info (auth required)
async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<MeResponse>, ServerStoreError> {
    let group_ids = state.sync.store().user_group_ids(&user.user_id).await?;
    Ok(Json(MeResponse {
        user_id: user.user_id,
        group_ids: group_ids.into_iter().collect(),
    }))
}

/// Pull-sync endpoint
async fn sync(
    State(state): State<AppState>,
    Extension(Caller(user)): Extension<Caller>,
    Query(request): Query<SyncRequest>,
) -> Result<Json<SyncResponse>, SyncServiceError> {
    let ctx = state.sync.access_context(user.as_ref()).await?;
    let response = state.sync.handle(&ctx, &request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade for the real-time channel.
async fn ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user) = query
        .token
        .as_deref()
        .and_then(|token| state.verifier.verify(token))
    else {
        return error_response(StatusCode::UNAUTHORIZED, "invalid_key", "Invalid or missing token");
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| handle_socket(socket, state, user))
}

/// Pumps queued events to the socket until either side closes.
async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    let (session_id, mut events) = match state.broadcaster.register(&user.user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::error!("Failed to register session for {}: {}", user.user_id, e);
            return;
        }
    };
    tracing::info!(session = %session_id, user = %user.user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unregister(session_id).await;
    tracing::info!(session = %session_id, "WebSocket disconnected");
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws));

    let sync_routes = Router::new()
        .route("/sync", get(sync))
        .layer(middleware::from_fn_with_state(state.clone(), optional_auth));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(me))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(sync_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::ApiKeyStore;
    use crate::server::store::ServerStore;
    use axum::body::Body;
    use eventsync_core::{GroupPermission, PermissionLevel, RetentionPriority};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn setup() -> (Router, ServerStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ServerStore::open(&temp_dir.path().join("server.db"))
            .await
            .unwrap();
        store.add_user_to_group("alice", "staff").await.unwrap();
        store
            .link_groups(&GroupPermission::new("staff", "public", PermissionLevel::View))
            .await
            .unwrap();

        let mut keys = ApiKeyStore::default();
        keys.insert("alice-key", "alice");

        let state = AppState {
            sync: SyncService::new(store.clone()),
            broadcaster: Arc::new(Broadcaster::new(store.clone())),
            verifier: Arc::new(keys),
        };
        (router(state), store, temp_dir)
    }

    async fn get_json(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _store, _temp) = setup().await;
        let (status, body) = get_json(app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_me_requires_auth() {
        let (app, _store, _temp) = setup().await;
        let (status, body) = get_json(app.clone(), "/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_auth");

        let (status, body) = get_json(app, "/me", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_key");
    }

    #[tokio::test]
    async fn test_me_returns_groups() {
        let (app, _store, _temp) = setup().await;
        let (status, body) = get_json(app, "/me", Some("alice-key")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["userId"], "alice");
        assert_eq!(body["groupIds"], json!(["staff"]));
    }

    #[tokio::test]
    async fn test_sync_filters_by_caller() {
        let (app, store, _temp) = setup().await;
        for (id, group) in [("e1", "public"), ("e2", "private")] {
            store
                .upsert_document(
                    "events",
                    id,
                    json!({"title": id}),
                    Some(&[group.to_string()]),
                    RetentionPriority::Medium,
                    None,
                )
                .await
                .unwrap();
        }

        let (status, body) =
            get_json(app.clone(), "/sync?collection=events", Some("alice-key")).await;
        assert_eq!(status, StatusCode::OK);
        let docs = body["documents"].as_array().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "e1");
        assert_eq!(docs[0]["metadata"]["version"], 1);
        assert_eq!(body["hasMore"], false);

        // Anonymous and bad tokens get an empty 200, not an error.
        for token in [None, Some("wrong")] {
            let (status, body) = get_json(app.clone(), "/sync?collection=events", token).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["documents"], json!([]));
        }
    }

    #[tokio::test]
    async fn test_sync_invalid_token_is_bad_request() {
        let (app, _store, _temp) = setup().await;
        let (status, body) = get_json(
            app,
            "/sync?collection=events&syncToken=%25%25",
            Some("alice-key"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_ws_rejects_missing_or_unknown_token() {
        let (app, _store, _temp) = setup().await;
        let (status, _) = get_json(app.clone(), "/ws", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get_json(app, "/ws?token=wrong", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ws_without_upgrade_headers_is_rejected() {
        let (app, _store, _temp) = setup().await;
        let (status, _) = get_json(app, "/ws?token=alice-key", None).await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::UNAUTHORIZED);
    }
}
