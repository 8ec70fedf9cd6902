//! Wire types shared by the sync server and device clients.
//!
//! Pull-sync is a plain HTTP request/response ([`SyncRequest`] /
//! [`SyncResponse`]). The real-time channel carries JSON text frames of the
//! form `{"event": "document:created", "payload": {...}}` ([`ServerEvent`]).
//! Field names are camelCase.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{DeletionRecord, SyncDocument};
use crate::error::CoreError;

/// Page size used when a request does not set one.
pub const DEFAULT_PAGE_LIMIT: usize = 100;
/// Largest page a server will return.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Pull request for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub collection: String,
    /// Inclusive lower bound on `lastModified`; absent means full snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Candidate rows to skip before the first returned document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Resume cursor from a previous page; overrides `since`/`offset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl SyncRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sync_token(mut self, token: impl Into<String>) -> Self {
        self.sync_token = Some(token.into());
        self
    }

    /// Requested page size, clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    /// Resolves where the page starts, preferring the sync token when
    /// present. A token resumes strictly after its key and ignores `offset`.
    pub fn cursor(&self) -> Result<PageCursor, CoreError> {
        match &self.sync_token {
            Some(token) => {
                let token = SyncToken::decode(token)?;
                Ok(PageCursor {
                    since: token.since,
                    after: Some(token.after),
                    offset: 0,
                })
            }
            None => Ok(PageCursor {
                since: self.since,
                after: None,
                offset: self.offset.unwrap_or(0),
            }),
        }
    }
}

/// Resolved starting point of a pull page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub since: Option<DateTime<Utc>>,
    /// Resume strictly after this key.
    pub after: Option<ScanKey>,
    pub offset: usize,
}

impl PageCursor {
    /// True for the first page of a pull, which also carries tombstones.
    pub fn is_first_page(&self) -> bool {
        self.after.is_none() && self.offset == 0
    }
}

/// Position in the `(last_modified, id)` ordering of a collection.
///
/// Keys are stable under concurrent writes: a row edited between two pages
/// moves past every key already handed out, so no unseen row is skipped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanKey {
    pub last_modified: DateTime<Utc>,
    pub id: String,
}

impl ScanKey {
    pub fn of(doc: &SyncDocument) -> Self {
        Self {
            last_modified: doc.last_modified(),
            id: doc.id.clone(),
        }
    }
}

/// One page of pull results.
///
/// Servers send typed documents; clients decode into
/// [`RawSyncResponse`] so a single malformed record can be skipped without
/// losing the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse<D = SyncDocument, R = DeletionRecord> {
    pub collection: String,
    #[serde(default)]
    pub documents: Vec<D>,
    #[serde(default)]
    pub deletions: Vec<R>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl<D, R> SyncResponse<D, R> {
    /// Response with nothing visible.
    pub fn empty(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Vec::new(),
            deletions: Vec::new(),
            has_more: false,
            sync_token: None,
        }
    }
}

/// Page with undecoded records.
pub type RawSyncResponse = SyncResponse<Value, Value>;

/// Opaque pagination cursor: the original `since` plus the key of the last
/// document handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub after: ScanKey,
}

impl SyncToken {
    /// Encodes as base64url JSON.
    pub fn encode(&self) -> Result<String, CoreError> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, CoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| CoreError::InvalidSyncToken(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::InvalidSyncToken(e.to_string()))
    }
}

/// Payload of `document:deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedPayload {
    pub collection: String,
    pub document_id: String,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub version: u64,
}

impl From<DeletionRecord> for DeletedPayload {
    fn from(record: DeletionRecord) -> Self {
        Self {
            collection: record.collection,
            document_id: record.id,
            deleted_at: record.deleted_at,
            deleted_by: record.deleted_by,
            version: record.version,
        }
    }
}

impl From<DeletedPayload> for DeletionRecord {
    fn from(payload: DeletedPayload) -> Self {
        DeletionRecord {
            id: payload.document_id,
            collection: payload.collection,
            deleted_at: payload.deleted_at,
            deleted_by: payload.deleted_by,
            version: payload.version,
        }
    }
}

/// Payload of `collection:cleared`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedPayload {
    pub collection: String,
}

/// Real-time event pushed from the server to connected sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "document:created")]
    DocumentCreated(SyncDocument),
    #[serde(rename = "document:updated")]
    DocumentUpdated(SyncDocument),
    #[serde(rename = "document:deleted")]
    DocumentDeleted(DeletedPayload),
    #[serde(rename = "collection:cleared")]
    CollectionCleared(ClearedPayload),
}

impl ServerEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::DocumentCreated(_) => "document:created",
            ServerEvent::DocumentUpdated(_) => "document:updated",
            ServerEvent::DocumentDeleted(_) => "document:deleted",
            ServerEvent::CollectionCleared(_) => "collection:cleared",
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ServerEvent::DocumentCreated(doc) | ServerEvent::DocumentUpdated(doc) => {
                &doc.collection
            }
            ServerEvent::DocumentDeleted(payload) => &payload.collection,
            ServerEvent::CollectionCleared(payload) => &payload.collection,
        }
    }

    /// Document id the event concerns, if it concerns a single document.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ServerEvent::DocumentCreated(doc) | ServerEvent::DocumentUpdated(doc) => Some(&doc.id),
            ServerEvent::DocumentDeleted(payload) => Some(&payload.document_id),
            ServerEvent::CollectionCleared(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Response from the `/me` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user_id: String,
    pub group_ids: Vec<String>,
}

/// Response from the `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_effective_limit_clamped() {
        assert_eq!(SyncRequest::new("events").effective_limit(), DEFAULT_PAGE_LIMIT);
        assert_eq!(SyncRequest::new("events").limit(0).effective_limit(), 1);
        assert_eq!(
            SyncRequest::new("events").limit(10_000).effective_limit(),
            MAX_PAGE_LIMIT
        );
    }

    fn key(id: &str) -> ScanKey {
        ScanKey {
            last_modified: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_sync_token_roundtrip() {
        let token = SyncToken {
            since: Some(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()),
            after: key("e200"),
        };
        let encoded = token.encode().unwrap();
        assert!(!encoded.contains('='));
        assert_eq!(SyncToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_sync_token_rejects_garbage() {
        assert!(matches!(
            SyncToken::decode("not a token!"),
            Err(CoreError::InvalidSyncToken(_))
        ));
    }

    #[test]
    fn test_cursor_prefers_token() {
        let token = SyncToken {
            since: None,
            after: key("e42"),
        }
        .encode()
        .unwrap();
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let request = SyncRequest::new("events")
            .since(Some(since))
            .offset(7)
            .sync_token(token);

        let cursor = request.cursor().unwrap();
        assert_eq!(cursor.after, Some(key("e42")));
        assert_eq!(cursor.offset, 0);
        assert_eq!(cursor.since, None);
        assert!(!cursor.is_first_page());

        let plain = SyncRequest::new("events").since(Some(since)).offset(7);
        let cursor = plain.cursor().unwrap();
        assert_eq!(cursor.offset, 7);
        assert_eq!(cursor.after, None);
        assert_eq!(cursor.since, Some(since));
        assert!(!cursor.is_first_page());

        assert!(SyncRequest::new("events").cursor().unwrap().is_first_page());
    }

    #[test]
    fn test_scan_key_orders_by_time_then_id() {
        let early = key("b");
        let same_time = key("c");
        let later = ScanKey {
            last_modified: early.last_modified + chrono::Duration::seconds(1),
            id: "a".into(),
        };
        assert!(early < same_time);
        assert!(same_time < later);
    }

    #[test]
    fn test_event_wire_format() {
        let doc = SyncDocument::new(
            "events",
            "e1",
            json!({"title": "Launch"}),
            2,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        );
        let text = ServerEvent::DocumentUpdated(doc).to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "document:updated");
        assert_eq!(value["payload"]["id"], "e1");
    }

    #[test]
    fn test_deleted_event_parse() {
        let text = r#"{"event":"document:deleted","payload":{"collection":"events","documentId":"e1","deletedAt":"2026-01-01T00:00:00Z","deletedBy":"u1","version":3}}"#;
        let event = ServerEvent::from_json(text).unwrap();
        assert_eq!(event.name(), "document:deleted");
        assert_eq!(event.collection(), "events");
        assert_eq!(event.document_id(), Some("e1"));

        match event {
            ServerEvent::DocumentDeleted(payload) => {
                let record: DeletionRecord = payload.into();
                assert_eq!(record.id, "e1");
                assert_eq!(record.version, 3);
            }
            _ => panic!("Expected DocumentDeleted"),
        }
    }

    #[test]
    fn test_cleared_event_parse() {
        let event =
            ServerEvent::from_json(r#"{"event":"collection:cleared","payload":{"collection":"tickets"}}"#)
                .unwrap();
        assert_eq!(event.collection(), "tickets");
        assert_eq!(event.document_id(), None);
    }

    #[test]
    fn test_raw_response_keeps_bad_records() {
        let text = r#"{"collection":"events","documents":[{"id":"broken"}],"deletions":[],"hasMore":false}"#;
        let page: RawSyncResponse = serde_json::from_str(text).unwrap();
        assert_eq!(page.documents.len(), 1);
        assert!(SyncDocument::from_value(page.documents[0].clone()).is_err());
    }
}
