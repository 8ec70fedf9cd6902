//! Real-time fan-out of document changes.
//!
//! Each connected session owns a bounded queue. Every event is checked
//! against each session's permissions before it is queued; a session that
//! cannot see the document never learns the event happened.

use eventsync_core::{
    AccessContext, ClearedPayload, DeletedPayload, DeletionRecord, GroupId, ServerEvent,
    SyncDocument,
};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::store::{ServerStore, ServerStoreError};

/// Events buffered per session before new ones are dropped.
pub const SESSION_QUEUE_CAPACITY: usize = 64;

/// Identifies one connected session.
pub type SessionId = Uuid;

struct Session {
    user_id: String,
    user_group_ids: BTreeSet<GroupId>,
    sender: mpsc::Sender<ServerEvent>,
}

/// Session registry plus permission-filtered delivery.
pub struct Broadcaster {
    store: ServerStore,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl Broadcaster {
    pub fn new(store: ServerStore) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session for `user_id` and returns its event queue.
    ///
    /// Group memberships are read once here; membership changes apply to
    /// sessions opened afterwards.
    pub async fn register(
        &self,
        user_id: &str,
    ) -> Result<(SessionId, mpsc::Receiver<ServerEvent>), ServerStoreError> {
        let user_group_ids = self.store.user_group_ids(user_id).await?;
        let (sender, receiver) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        self.sessions.write().await.insert(
            id,
            Session {
                user_id: user_id.to_string(),
                user_group_ids,
                sender,
            },
        );

        tracing::debug!(session = %id, user = user_id, "Registered session");
        Ok((id, receiver))
    }

    pub async fn unregister(&self, id: SessionId) {
        if self.sessions.write().await.remove(&id).is_some() {
            tracing::debug!(session = %id, "Unregistered session");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn emit_document_created(&self, doc: &SyncDocument) -> Result<usize, ServerStoreError> {
        self.emit_document(ServerEvent::DocumentCreated(doc.clone()))
            .await
    }

    pub async fn emit_document_updated(&self, doc: &SyncDocument) -> Result<usize, ServerStoreError> {
        self.emit_document(ServerEvent::DocumentUpdated(doc.clone()))
            .await
    }

    /// Announces a deletion. The tombstone must already exist; if it does
    /// not, nothing is sent.
    pub async fn emit_document_deleted(
        &self,
        collection: &str,
        id: &str,
        actor_user_id: &str,
    ) -> Result<usize, ServerStoreError> {
        let Some(record) = self.store.get_deletion(collection, id).await? else {
            tracing::warn!(
                collection,
                id,
                actor = actor_user_id,
                "No tombstone for deleted document, skipping broadcast"
            );
            return Ok(0);
        };

        self.emit_document(ServerEvent::DocumentDeleted(DeletedPayload::from(record)))
            .await
    }

    /// Announces that a collection was wiped, to sessions that could see at
    /// least one of the `cleared` documents. Tombstones keep their group
    /// tags, so visibility is judged as it was before the clear.
    pub async fn emit_collection_cleared(
        &self,
        collection: &str,
        cleared: &[DeletionRecord],
    ) -> Result<usize, ServerStoreError> {
        if cleared.is_empty() {
            return Ok(0);
        }

        let mut documents = Vec::with_capacity(cleared.len());
        for record in cleared {
            let groups = self.store.document_group_ids(collection, &record.id).await?;
            documents.push((record.id.as_str(), groups));
        }
        let group_permissions = self.store.group_permissions().await?;
        let permissions = self.store.permissions().await?;
        let event = ServerEvent::CollectionCleared(ClearedPayload {
            collection: collection.to_string(),
        });

        let delivered = self
            .deliver(&event, |session| {
                let ctx = AccessContext::new(
                    Some(session.user_id.clone()),
                    session.user_group_ids.clone(),
                    group_permissions.clone(),
                    permissions.clone(),
                );
                documents
                    .iter()
                    .any(|(id, groups)| ctx.can_view(collection, id, groups))
            })
            .await;

        tracing::debug!(
            event = event.name(),
            collection,
            cleared = cleared.len(),
            delivered,
            "Broadcast event"
        );
        Ok(delivered)
    }

    async fn emit_document(&self, event: ServerEvent) -> Result<usize, ServerStoreError> {
        let collection = event.collection().to_string();
        let id = event.document_id().unwrap_or_default().to_string();

        // Loaded once per event, not once per session.
        let document_groups = self.store.document_group_ids(&collection, &id).await?;
        let group_permissions = self.store.group_permissions().await?;
        let permissions = self.store.permissions().await?;

        let delivered = self
            .deliver(&event, |session| {
                AccessContext::new(
                    Some(session.user_id.clone()),
                    session.user_group_ids.clone(),
                    group_permissions.clone(),
                    permissions.clone(),
                )
                .can_view(&collection, &id, &document_groups)
            })
            .await;

        tracing::debug!(
            event = event.name(),
            collection = %collection,
            id = %id,
            delivered,
            "Broadcast event"
        );
        Ok(delivered)
    }

    /// Queues `event` for every session `allowed` accepts. Never waits on a
    /// session: a full or closed queue loses the event for that session.
    async fn deliver<F>(&self, event: &ServerEvent, allowed: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;

        for (id, session) in sessions.iter() {
            if !allowed(session) {
                continue;
            }
            match session.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session = %id, event = event.name(), "Session queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(session = %id, "Session queue closed");
                }
            }
        }

        delivered
    }
}
