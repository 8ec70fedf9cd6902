//! Server-side modules for the eventsync server.
//!
//! [`SyncEngine`] bundles the store, the pull-sync service and the
//! broadcaster. Applications embedding the engine publish writes through it
//! so every stored change is also announced to live sessions.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod http;
pub mod store;
pub mod sync;

pub use auth::{ApiKeyStore, AuthUser, TokenVerifier};
pub use broadcast::{Broadcaster, SessionId};
pub use config::ServerConfig;
pub use http::{router, AppState};
pub use store::{ServerStore, ServerStoreError, UpsertOutcome};
pub use sync::{DocumentPage, SyncService, SyncServiceError};

use chrono::{DateTime, Utc};
use eventsync_core::{DeletionRecord, GroupId, RetentionPriority, SyncDocument};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Store, sync service and broadcaster sharing one database.
#[derive(Clone)]
pub struct SyncEngine {
    store: ServerStore,
    sync: SyncService,
    broadcaster: Arc<Broadcaster>,
}

impl SyncEngine {
    pub async fn open(path: &Path) -> Result<Self, ServerStoreError> {
        Ok(Self::new(ServerStore::open(path).await?))
    }

    pub fn new(store: ServerStore) -> Self {
        Self {
            sync: SyncService::new(store.clone()),
            broadcaster: Arc::new(Broadcaster::new(store.clone())),
            store,
        }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Router state for serving this engine behind `verifier`.
    pub fn app_state(&self, verifier: Arc<dyn TokenVerifier>) -> AppState {
        AppState {
            sync: self.sync.clone(),
            broadcaster: self.broadcaster.clone(),
            verifier,
        }
    }

    /// Stores a document at the next version and announces it.
    pub async fn publish(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        groups: Option<&[GroupId]>,
        priority: RetentionPriority,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SyncDocument, ServerStoreError> {
        let outcome = self
            .store
            .upsert_document(collection, id, data, groups, priority, expires_at)
            .await?;

        if outcome.created {
            self.broadcaster
                .emit_document_created(&outcome.document)
                .await?;
        } else {
            self.broadcaster
                .emit_document_updated(&outcome.document)
                .await?;
        }
        Ok(outcome.document)
    }

    /// Tombstones a document and announces the deletion.
    pub async fn retract(
        &self,
        collection: &str,
        id: &str,
        actor_user_id: &str,
    ) -> Result<Option<DeletionRecord>, ServerStoreError> {
        let record = self
            .store
            .delete_document(collection, id, actor_user_id)
            .await?;
        if record.is_some() {
            self.broadcaster
                .emit_document_deleted(collection, id, actor_user_id)
                .await?;
        }
        Ok(record)
    }

    /// Tombstones a whole collection and announces it.
    pub async fn clear(
        &self,
        collection: &str,
        actor_user_id: &str,
    ) -> Result<Vec<DeletionRecord>, ServerStoreError> {
        let records = self
            .store
            .clear_collection(collection, actor_user_id)
            .await?;
        self.broadcaster
            .emit_collection_cleared(collection, &records)
            .await?;
        Ok(records)
    }
}
