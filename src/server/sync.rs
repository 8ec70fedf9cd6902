//! Pull-sync service.
//!
//! Answers "everything changed in collection C since T that the caller may
//! see". The caller's [`AccessContext`] is resolved once per request and
//! reused for every candidate; hidden documents are omitted, never reported.

use chrono::{DateTime, Utc};
use eventsync_core::{
    timestamp, AccessContext, CoreError, DeletionRecord, ScanKey, SyncDocument, SyncRequest,
    SyncResponse, SyncToken,
};
use thiserror::Error;

use super::auth::AuthUser;
use super::store::{ServerStore, ServerStoreError};

/// Candidate rows read per store query while filling a page.
const SCAN_BATCH: usize = 200;

/// Errors that can occur while answering a pull request.
#[derive(Debug, Error)]
pub enum SyncServiceError {
    #[error(transparent)]
    Store(#[from] ServerStoreError),

    /// The request itself is unusable (e.g. a corrupt sync token).
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] CoreError),
}

/// One page of visible documents.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub documents: Vec<SyncDocument>,
    pub has_more: bool,
    /// Key of the last returned document; the next page starts after it.
    pub resume_after: Option<ScanKey>,
}

/// Server-side pull-sync.
#[derive(Debug, Clone)]
pub struct SyncService {
    store: ServerStore,
}

impl SyncService {
    pub fn new(store: ServerStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    /// Resolves the caller's permissions. Unauthenticated callers get an
    /// empty context.
    pub async fn access_context(
        &self,
        user: Option<&AuthUser>,
    ) -> Result<AccessContext, SyncServiceError> {
        match user {
            Some(user) => Ok(self.store.access_context(&user.user_id).await?),
            None => Ok(AccessContext::anonymous()),
        }
    }

    /// Visible, unexpired documents with `last_modified >= since`, ordered
    /// by `(last_modified, id)`.
    ///
    /// The page starts strictly after `after` when given, then skips
    /// `offset` candidate rows. `has_more` is only set when another visible
    /// document exists.
    pub async fn get_documents(
        &self,
        ctx: &AccessContext,
        collection: &str,
        since: Option<DateTime<Utc>>,
        after: Option<&ScanKey>,
        limit: usize,
        offset: usize,
    ) -> Result<DocumentPage, SyncServiceError> {
        let mut page = DocumentPage {
            documents: Vec::new(),
            has_more: false,
            resume_after: None,
        };
        if !ctx.has_any_access() || limit == 0 {
            return Ok(page);
        }

        let now = timestamp::now();
        let mut position = after.cloned();
        let mut skip = offset;

        loop {
            let batch = self
                .store
                .scan_documents(collection, since, position.as_ref(), skip, SCAN_BATCH)
                .await?;
            let exhausted = batch.len() < SCAN_BATCH;
            skip = 0;

            for (doc, groups) in batch {
                let key = ScanKey::of(&doc);
                if !doc.is_expired_at(now) && ctx.can_view(collection, &doc.id, &groups) {
                    if page.documents.len() == limit {
                        page.has_more = true;
                        page.resume_after = page.documents.last().map(ScanKey::of);
                        return Ok(page);
                    }
                    page.documents.push(doc);
                }
                position = Some(key);
            }

            if exhausted {
                return Ok(page);
            }
        }
    }

    /// Visible tombstones with `deleted_at >= since`.
    pub async fn get_deletions(
        &self,
        ctx: &AccessContext,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DeletionRecord>, SyncServiceError> {
        if !ctx.has_any_access() {
            return Ok(Vec::new());
        }

        let records = self.store.scan_deletions(collection, since).await?;
        Ok(records
            .into_iter()
            .filter(|(record, groups)| ctx.can_view(collection, &record.id, groups))
            .map(|(record, _)| record)
            .collect())
    }

    /// Answers a full pull request. Tombstones ride on the first page only.
    pub async fn handle(
        &self,
        ctx: &AccessContext,
        request: &SyncRequest,
    ) -> Result<SyncResponse, SyncServiceError> {
        let cursor = request.cursor()?;
        let limit = request.effective_limit();

        let page = self
            .get_documents(
                ctx,
                &request.collection,
                cursor.since,
                cursor.after.as_ref(),
                limit,
                cursor.offset,
            )
            .await?;

        let deletions = if cursor.is_first_page() {
            self.get_deletions(ctx, &request.collection, cursor.since)
                .await?
        } else {
            Vec::new()
        };

        let sync_token = match (page.has_more, page.resume_after.clone()) {
            (true, Some(after)) => Some(
                SyncToken {
                    since: cursor.since,
                    after,
                }
                .encode()?,
            ),
            _ => None,
        };

        tracing::debug!(
            collection = %request.collection,
            user = ?ctx.user_id(),
            documents = page.documents.len(),
            deletions = deletions.len(),
            has_more = page.has_more,
            "Answered sync request"
        );

        Ok(SyncResponse {
            collection: request.collection.clone(),
            documents: page.documents,
            deletions,
            has_more: page.has_more,
            sync_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventsync_core::{GroupPermission, PermissionLevel, RetentionPriority};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (SyncService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ServerStore::open(&temp_dir.path().join("server.db"))
            .await
            .unwrap();

        store.add_user_to_group("alice", "staff").await.unwrap();
        store
            .link_groups(&GroupPermission::new("staff", "public", PermissionLevel::View))
            .await
            .unwrap();

        (SyncService::new(store), temp_dir)
    }

    async fn put(service: &SyncService, id: &str, micros: i64, groups: &[&str]) {
        let doc = SyncDocument::new(
            "events",
            id,
            json!({"id": id}),
            1,
            timestamp::from_micros(micros).unwrap(),
        );
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        service.store().put_document(&doc, Some(&groups)).await.unwrap();
    }

    fn alice() -> AuthUser {
        AuthUser {
            user_id: "alice".into(),
        }
    }

    #[tokio::test]
    async fn test_filters_hidden_documents() {
        let (service, _temp) = setup().await;
        put(&service, "e1", 1, &["public"]).await;
        put(&service, "e2", 2, &["private"]).await;
        put(&service, "e3", 3, &[]).await;

        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let page = service
            .get_documents(&ctx, "events", None, None, 10, 0)
            .await
            .unwrap();

        let ids: Vec<&str> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["e1"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_anonymous_gets_empty_result() {
        let (service, _temp) = setup().await;
        put(&service, "e1", 1, &["public"]).await;

        let ctx = service.access_context(None).await.unwrap();
        let response = service
            .handle(&ctx, &SyncRequest::new("events"))
            .await
            .unwrap();
        assert!(response.documents.is_empty());
        assert!(response.deletions.is_empty());
        assert!(!response.has_more);
    }

    #[tokio::test]
    async fn test_ungrouped_user_gets_empty_result() {
        let (service, _temp) = setup().await;
        put(&service, "e1", 1, &["public"]).await;

        let nobody = AuthUser {
            user_id: "mallory".into(),
        };
        let ctx = service.access_context(Some(&nobody)).await.unwrap();
        let response = service
            .handle(&ctx, &SyncRequest::new("events"))
            .await
            .unwrap();
        assert!(response.documents.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_skips_hidden_and_resumes_with_token() {
        let (service, _temp) = setup().await;
        put(&service, "a", 1, &["public"]).await;
        put(&service, "b", 2, &["private"]).await;
        put(&service, "c", 3, &["public"]).await;
        put(&service, "d", 4, &["private"]).await;
        put(&service, "e", 5, &["public"]).await;
        put(&service, "f", 6, &["private"]).await;

        let ctx = service.access_context(Some(&alice())).await.unwrap();

        let first = service
            .handle(&ctx, &SyncRequest::new("events").limit(2))
            .await
            .unwrap();
        let ids: Vec<&str> = first.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(first.has_more);
        let token = first.sync_token.clone().unwrap();

        let second = service
            .handle(&ctx, &SyncRequest::new("events").limit(2).sync_token(token))
            .await
            .unwrap();
        let ids: Vec<&str> = second.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["e"]);
        // Trailing hidden document does not signal more pages
        assert!(!second.has_more);
        assert!(second.sync_token.is_none());
    }

    #[tokio::test]
    async fn test_edit_between_pages_does_not_skip_rows() {
        let (service, _temp) = setup().await;
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            put(&service, id, i as i64 + 1, &["public"]).await;
        }
        let ctx = service.access_context(Some(&alice())).await.unwrap();

        let first = service
            .handle(&ctx, &SyncRequest::new("events").limit(2))
            .await
            .unwrap();
        let mut seen: Vec<String> = first.documents.iter().map(|d| d.id.clone()).collect();
        assert_eq!(seen, vec!["a", "b"]);

        // "a" moves to the end of the ordering while the client is paging
        service
            .store()
            .upsert_document(
                "events",
                "a",
                json!({"edited": true}),
                Some(&["public".to_string()]),
                RetentionPriority::Medium,
                None,
            )
            .await
            .unwrap();

        let mut token = first.sync_token;
        while let Some(t) = token.take() {
            let page = service
                .handle(&ctx, &SyncRequest::new("events").limit(2).sync_token(t))
                .await
                .unwrap();
            seen.extend(page.documents.iter().map(|d| d.id.clone()));
            token = page.sync_token;
        }

        assert_eq!(seen, vec!["a", "b", "c", "d", "a"]);
    }

    #[tokio::test]
    async fn test_offset_skips_candidates_on_plain_request() {
        let (service, _temp) = setup().await;
        put(&service, "a", 1, &["public"]).await;
        put(&service, "b", 2, &["private"]).await;
        put(&service, "c", 3, &["public"]).await;

        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let response = service
            .handle(&ctx, &SyncRequest::new("events").offset(1))
            .await
            .unwrap();
        let ids: Vec<&str> = response.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn test_since_is_inclusive() {
        let (service, _temp) = setup().await;
        put(&service, "a", 10, &["public"]).await;
        put(&service, "b", 20, &["public"]).await;
        put(&service, "c", 30, &["public"]).await;

        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let page = service
            .get_documents(&ctx, "events", timestamp::from_micros(20), None, 10, 0)
            .await
            .unwrap();
        let ids: Vec<&str> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_expired_documents_omitted() {
        let (service, _temp) = setup().await;
        service
            .store()
            .upsert_document(
                "events",
                "gone",
                json!({}),
                Some(&["public".to_string()]),
                RetentionPriority::Temporary,
                Some(timestamp::now() - chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();

        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let page = service
            .get_documents(&ctx, "events", None, None, 10, 0)
            .await
            .unwrap();
        assert!(page.documents.is_empty());
    }

    #[tokio::test]
    async fn test_deletions_filtered_and_first_page_only() {
        let (service, _temp) = setup().await;
        let store = service.store().clone();
        for (id, group) in [("a", "public"), ("b", "private"), ("c", "public")] {
            store
                .upsert_document(
                    "events",
                    id,
                    json!({}),
                    Some(&[group.to_string()]),
                    RetentionPriority::Medium,
                    None,
                )
                .await
                .unwrap();
        }
        store.delete_document("events", "a", "admin").await.unwrap();
        store.delete_document("events", "b", "admin").await.unwrap();

        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let deletions = service.get_deletions(&ctx, "events", None).await.unwrap();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].id, "a");
        assert_eq!(deletions[0].version, 2);

        let resumed = SyncToken {
            since: None,
            after: ScanKey {
                last_modified: timestamp::from_micros(0).unwrap(),
                id: String::new(),
            },
        }
        .encode()
        .unwrap();
        let response = service
            .handle(&ctx, &SyncRequest::new("events").sync_token(resumed))
            .await
            .unwrap();
        assert!(response.deletions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_is_request_error() {
        let (service, _temp) = setup().await;
        let ctx = service.access_context(Some(&alice())).await.unwrap();
        let result = service
            .handle(&ctx, &SyncRequest::new("events").sync_token("%%%"))
            .await;
        assert!(matches!(result, Err(SyncServiceError::InvalidRequest(_))));
    }
}
