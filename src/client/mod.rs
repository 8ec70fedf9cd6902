//! Device-side sync client.
//!
//! [`SyncClient`] owns the local replica and keeps it current by two racing
//! paths: pull-sync ([`SyncClient::sync_collection`]) and pushed events from
//! the real-time channel ([`SyncClient::apply_server_event`]). Both paths
//! write through the store's version guard, so the final state does not
//! depend on which arrives first.
//!
//! ```no_run
//! # async fn demo() -> Result<(), eventsync::client::ClientError> {
//! use eventsync::client::{ClientConfig, Subscriber, SyncClient};
//!
//! let client = SyncClient::new(ClientConfig::new("http://localhost:8080"));
//! client.init().await?;
//! let subscription = client.subscribe(
//!     "events",
//!     Subscriber::new().on_update(|doc| println!("{} v{}", doc.id, doc.version())),
//! );
//! client.sync_all().await?;
//! subscription.unsubscribe();
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod realtime;
pub mod storage;
pub mod subscriptions;
pub mod transport;

pub use error::ClientError;
pub use storage::{LocalStore, PutOutcome, StorageError, StorageStats, DEFAULT_MAX_STORAGE_SIZE};
pub use subscriptions::{Registry, Subscriber, Subscription};
pub use transport::{build_http_url, build_ws_url, HttpTransport, SyncTransport};

use chrono::{DateTime, Utc};
use eventsync_core::{
    DeletionRecord, ServerEvent, SyncDocument, SyncRequest, SyncState, SyncStatus,
    DEFAULT_PAGE_LIMIT,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_DB_NAME: &str = "eventsync";

/// Runtime configuration of a [`SyncClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    /// Real-time channel; no push connection when unset.
    pub socket_url: Option<String>,
    pub auth_token: Option<String>,
    pub db_name: String,
    pub data_dir: PathBuf,
    pub max_storage_size: u64,
    /// Periodic pull; zero disables it.
    pub sync_interval: Duration,
    pub reconnect_delay: Duration,
    pub page_size: usize,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            socket_url: None,
            auth_token: None,
            db_name: DEFAULT_DB_NAME.to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("eventsync"),
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            page_size: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Local lifecycle signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Complete { collection: String },
    Error { collection: String, message: String },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Complete { .. } => "sync:complete",
            SyncEvent::Error { .. } => "sync:error",
        }
    }
}

/// Outcome of one `sync_collection` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub collection: String,
    pub pages: usize,
    pub applied: usize,
    pub deleted: usize,
    pub stale: usize,
    /// Malformed or oversized records that were skipped.
    pub skipped: usize,
    pub cursor: Option<DateTime<Utc>>,
}

struct ClientInner<T> {
    config: ClientConfig,
    transport: T,
    store: RwLock<Option<LocalStore>>,
    subscriptions: Arc<Registry>,
    state: RwLock<SyncState>,
    in_flight: AtomicUsize,
    collection_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Device-side orchestrator. Cheap to clone; clones share state.
pub struct SyncClient<T: SyncTransport = HttpTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: SyncTransport> Clone for SyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SyncClient<HttpTransport> {
    pub fn new(config: ClientConfig) -> Self {
        let transport = HttpTransport::new(&config.api_url, config.auth_token.clone());
        Self::with_transport(config, transport)
    }
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let (events, _) = broadcast::channel(32);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                store: RwLock::new(None),
                subscriptions: Arc::new(Registry::new()),
                state: RwLock::new(SyncState::default()),
                in_flight: AtomicUsize::new(0),
                collection_locks: Mutex::new(HashMap::new()),
                events,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Opens the local store and starts the background tasks. Returns once
    /// storage is ready; the first sync happens in the background.
    pub async fn init(&self) -> Result<(), ClientError> {
        if self.inner.store.read().is_none() {
            let config = &self.inner.config;
            let store =
                LocalStore::open(&config.data_dir, &config.db_name, config.max_storage_size)
                    .await?;
            *self.inner.store.write() = Some(store);
        }

        self.inner.shutdown.send_replace(false);
        let mut tasks = self.inner.tasks.lock();

        if let Some(socket_url) = self.inner.config.socket_url.clone() {
            let client = self.clone();
            let shutdown = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(realtime::run(client, socket_url, shutdown)));
        }

        let interval = self.inner.config.sync_interval;
        if !interval.is_zero() {
            let client = self.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = client.sync_all().await {
                                tracing::debug!("Periodic sync failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        tracing::debug!("Sync client initialized");
        Ok(())
    }

    /// Stops background tasks, drops subscriptions and closes the store.
    /// Local data stays on disk.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.inner.subscriptions.clear();
        *self.inner.state.write() = SyncState::default();

        let store = self.inner.store.write().take();
        if let Some(store) = store {
            store.close().await;
        }
        tracing::debug!("Sync client disconnected");
    }

    fn store(&self) -> Result<LocalStore, ClientError> {
        self.inner
            .store
            .read()
            .clone()
            .ok_or(ClientError::NotInitialized)
    }

    // ------------------------------------------------------------------
    // Subscriptions and signals
    // ------------------------------------------------------------------

    pub fn subscribe(&self, collection: &str, subscriber: Subscriber) -> Subscription {
        let subscription = self.inner.subscriptions.subscribe(collection, subscriber);
        let mut state = self.inner.state.write();
        if !state.collections.iter().any(|c| c == collection) {
            state.collections.push(collection.to_string());
        }
        subscription
    }

    /// Lifecycle signals (`sync:complete`, `sync:error`).
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.read().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.read().status
    }

    pub(crate) fn report_error(&self, collection: &str, error: &ClientError) {
        self.inner.subscriptions.notify_error(collection, error);
    }

    /// Keeps a background task alive until `disconnect`.
    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn mark_offline(&self, error: &ClientError) {
        self.inner
            .state
            .write()
            .fail(SyncStatus::Offline, error.to_string());
    }

    fn begin_sync(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.state.write().transition(SyncStatus::Syncing);
    }

    fn finish_sync(&self, collection: &str, result: &Result<SyncReport, ClientError>) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;

        match result {
            Ok(report) => {
                {
                    let mut state = self.inner.state.write();
                    if let Some(cursor) = report.cursor {
                        state.last_sync.insert(collection.to_string(), cursor);
                    }
                    if remaining == 0 {
                        state.settle();
                    }
                }
                let _ = self.inner.events.send(SyncEvent::Complete {
                    collection: collection.to_string(),
                });
            }
            Err(e) => {
                let status = if e.is_connectivity() {
                    SyncStatus::Offline
                } else {
                    SyncStatus::Error
                };
                self.inner.state.write().fail(status, e.to_string());
                self.report_error(collection, e);
                let _ = self.inner.events.send(SyncEvent::Error {
                    collection: collection.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn collection_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .collection_locks
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    /// Pulls a collection until the server reports no more pages, then
    /// advances the stored cursor. Runs for a collection are serialized.
    ///
    /// `since` overrides the stored cursor; `None` resumes from it (or takes
    /// a full snapshot on first sync).
    pub async fn sync_collection(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, ClientError> {
        let store = self.store()?;
        let lock = self.collection_lock(collection);
        let _guard = lock.lock().await;

        self.begin_sync();
        let result = self.pull(&store, collection, since).await;
        self.finish_sync(collection, &result);

        if let Ok(report) = &result {
            tracing::debug!(
                collection,
                pages = report.pages,
                applied = report.applied,
                deleted = report.deleted,
                stale = report.stale,
                skipped = report.skipped,
                "Sync complete"
            );
        }
        result
    }

    async fn pull(
        &self,
        store: &LocalStore,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, ClientError> {
        let since = match since {
            Some(since) => Some(since),
            None => store.last_sync(collection).await?,
        };

        let mut report = SyncReport {
            collection: collection.to_string(),
            ..Default::default()
        };
        let mut token: Option<String> = None;

        loop {
            let mut request = SyncRequest::new(collection)
                .since(since)
                .limit(self.inner.config.page_size);
            if let Some(token) = token.take() {
                request = request.sync_token(token);
            }

            let page = self.inner.transport.fetch(&request).await?;
            report.pages += 1;

            for raw in page.documents {
                let doc = match SyncDocument::from_value(raw) {
                    Ok(doc) => doc,
                    Err(e) => {
                        report.skipped += 1;
                        self.report_error(collection, &ClientError::Core(e));
                        continue;
                    }
                };
                let modified = doc.last_modified();
                match self.apply_document(store, &doc).await {
                    Ok(true) => report.applied += 1,
                    Ok(false) => report.stale += 1,
                    Err(ClientError::Storage(e @ StorageError::DocumentTooLarge { .. })) => {
                        report.skipped += 1;
                        self.report_error(collection, &ClientError::Storage(e));
                    }
                    Err(e) => return Err(e),
                }
                report.cursor = report.cursor.max(Some(modified));
            }

            for raw in page.deletions {
                let record = match DeletionRecord::from_value(raw) {
                    Ok(record) => record,
                    Err(e) => {
                        report.skipped += 1;
                        self.report_error(collection, &ClientError::Core(e));
                        continue;
                    }
                };
                let deleted_at = record.deleted_at;
                if self.apply_tombstone(store, &record).await? {
                    report.deleted += 1;
                } else {
                    report.stale += 1;
                }
                report.cursor = report.cursor.max(Some(deleted_at));
            }

            if !page.has_more {
                break;
            }
            match page.sync_token {
                Some(next) => token = Some(next),
                None => {
                    tracing::warn!("Server reported more pages without a sync token");
                    break;
                }
            }
        }

        if let Some(cursor) = report.cursor {
            store.set_last_sync(collection, cursor).await?;
        }
        Ok(report)
    }

    /// Syncs every subscribed collection. Stops at the first failure.
    pub async fn sync_all(&self) -> Result<Vec<SyncReport>, ClientError> {
        let mut reports = Vec::new();
        for collection in self.inner.subscriptions.collections() {
            reports.push(self.sync_collection(&collection, None).await?);
        }
        Ok(reports)
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Merges one pushed event. Returns whether anything changed locally.
    /// Events for collections nobody is subscribed to are ignored.
    pub async fn apply_server_event(&self, event: ServerEvent) -> Result<bool, ClientError> {
        if !self.inner.subscriptions.has_subscribers(event.collection()) {
            tracing::trace!(event = event.name(), "No subscribers, ignoring event");
            return Ok(false);
        }
        let store = self.store()?;

        match event {
            ServerEvent::DocumentCreated(doc) | ServerEvent::DocumentUpdated(doc) => {
                doc.validate()?;
                self.apply_document(&store, &doc).await
            }
            ServerEvent::DocumentDeleted(payload) => {
                self.apply_tombstone(&store, &DeletionRecord::from(payload))
                    .await
            }
            ServerEvent::CollectionCleared(payload) => {
                let ids = store.clear_collection(&payload.collection).await?;
                for id in &ids {
                    self.inner
                        .subscriptions
                        .notify_delete(&payload.collection, id);
                }
                Ok(!ids.is_empty())
            }
        }
    }

    async fn apply_document(&self, store: &LocalStore, doc: &SyncDocument) -> Result<bool, ClientError> {
        match store.put(doc).await? {
            PutOutcome::Applied => {
                self.inner.subscriptions.notify_update(doc);
                Ok(true)
            }
            PutOutcome::Stale => Ok(false),
        }
    }

    async fn apply_tombstone(
        &self,
        store: &LocalStore,
        record: &DeletionRecord,
    ) -> Result<bool, ClientError> {
        match store.put_tombstone(record).await? {
            PutOutcome::Applied => {
                self.inner
                    .subscriptions
                    .notify_delete(&record.collection, &record.id);
                Ok(true)
            }
            PutOutcome::Stale => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Local reads
    // ------------------------------------------------------------------

    pub async fn get_documents(&self, collection: &str) -> Result<Vec<SyncDocument>, ClientError> {
        Ok(self.store()?.get_by_collection(collection).await?)
    }

    pub async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<SyncDocument>, ClientError> {
        Ok(self.store()?.get_one(collection, id).await?)
    }

    /// Local documents decoded into an application type.
    pub async fn get_documents_as<D: DeserializeOwned>(
        &self,
        collection: &str,
    ) -> Result<Vec<SyncDocument<D>>, ClientError> {
        self.get_documents(collection)
            .await?
            .iter()
            .map(|doc| doc.decode::<D>().map_err(ClientError::from))
            .collect()
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, ClientError> {
        Ok(self.store()?.stats().await?)
    }

    pub async fn cleanup_expired(&self) -> Result<u64, ClientError> {
        Ok(self.store()?.cleanup_expired().await?)
    }

    pub async fn ensure_storage_space(&self) -> Result<u64, ClientError> {
        Ok(self.store()?.ensure_storage_space().await?)
    }

    /// Collections present in the local store.
    pub async fn local_collections(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store()?.collections().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventsync_core::{timestamp, DeletedPayload, RawSyncResponse};
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Replays canned pages and records the requests it saw.
    #[derive(Default)]
    struct ScriptedTransport {
        pages: Mutex<VecDeque<Result<RawSyncResponse, ClientError>>>,
        requests: Mutex<Vec<SyncRequest>>,
    }

    impl ScriptedTransport {
        fn push(&self, page: RawSyncResponse) {
            self.pages.lock().push_back(Ok(page));
        }

        fn fail(&self, error: ClientError) {
            self.pages.lock().push_back(Err(error));
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn fetch(&self, request: &SyncRequest) -> Result<RawSyncResponse, ClientError> {
            self.requests.lock().push(request.clone());
            self.pages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(RawSyncResponse::empty(request.collection.clone())))
        }
    }

    fn at(micros: i64) -> DateTime<Utc> {
        timestamp::from_micros(micros).unwrap()
    }

    fn raw_doc(id: &str, version: u64, modified: i64) -> Value {
        serde_json::to_value(SyncDocument::new(
            "events",
            id,
            json!({"title": format!("Event {}", id)}),
            version,
            at(modified),
        ))
        .unwrap()
    }

    fn page(documents: Vec<Value>, deletions: Vec<Value>, token: Option<&str>) -> RawSyncResponse {
        RawSyncResponse {
            collection: "events".into(),
            documents,
            deletions,
            has_more: token.is_some(),
            sync_token: token.map(str::to_string),
        }
    }

    async fn setup() -> (SyncClient<ScriptedTransport>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ClientConfig::new("http://localhost:0");
        config.data_dir = temp_dir.path().to_path_buf();
        config.sync_interval = Duration::ZERO;

        let client = SyncClient::with_transport(config, ScriptedTransport::default());
        client.init().await.unwrap();
        (client, temp_dir)
    }

    fn log_subscriber(log: &Arc<Mutex<Vec<String>>>) -> Subscriber {
        let updates = log.clone();
        let deletes = log.clone();
        let errors = log.clone();
        Subscriber::new()
            .on_update(move |d| updates.lock().push(format!("update:{}:v{}", d.id, d.version())))
            .on_delete(move |id| deletes.lock().push(format!("delete:{}", id)))
            .on_error(move |_| errors.lock().push("error".to_string()))
    }

    #[tokio::test]
    async fn test_uninitialized_client_errors() {
        let client = SyncClient::with_transport(
            ClientConfig::new("http://localhost:0"),
            ScriptedTransport::default(),
        );
        let err = client.get_documents("events").await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
    }

    #[tokio::test]
    async fn test_sync_follows_pages_and_advances_cursor() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));

        let transport = client.transport();
        transport.push(page(vec![raw_doc("e1", 1, 10), raw_doc("e2", 1, 20)], vec![], Some("t1")));
        transport.push(page(vec![raw_doc("e3", 1, 30)], vec![], None));

        let report = client.sync_collection("events", None).await.unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.applied, 3);
        assert_eq!(report.cursor, Some(at(30)));
        assert_eq!(client.get_documents("events").await.unwrap().len(), 3);
        assert_eq!(client.status(), SyncStatus::Idle);
        assert_eq!(client.state().last_sync.get("events"), Some(&at(30)));

        let requests = transport.requests.lock().clone();
        assert_eq!(requests[0].since, None);
        assert_eq!(requests[1].sync_token.as_deref(), Some("t1"));

        // Next run resumes from the stored cursor.
        client.sync_collection("events", None).await.unwrap();
        assert_eq!(transport.requests.lock()[2].since, Some(at(30)));
    }

    #[tokio::test]
    async fn test_malformed_record_skipped_and_reported() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));

        client.transport().push(page(
            vec![json!({"id": "broken"}), raw_doc("e1", 1, 10)],
            vec![json!({"id": "", "collection": "events"})],
            None,
        ));

        let report = client.sync_collection("events", None).await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(*log.lock(), vec!["error", "update:e1:v1", "error"]);
    }

    #[tokio::test]
    async fn test_connect_failure_goes_offline() {
        let (client, _temp) = setup().await;
        let mut events = client.events();
        client
            .transport()
            .fail(ClientError::Connection("refused".into()));

        assert!(client.sync_collection("events", None).await.is_err());
        let state = client.state();
        assert_eq!(state.status, SyncStatus::Offline);
        assert!(state.error.unwrap().contains("refused"));
        assert_eq!(events.recv().await.unwrap().name(), "sync:error");

        // Recovery: OFFLINE -> SYNCING -> IDLE
        client.sync_collection("events", None).await.unwrap();
        assert_eq!(client.status(), SyncStatus::Idle);
        assert_eq!(events.recv().await.unwrap().name(), "sync:complete");
    }

    #[tokio::test]
    async fn test_success_after_overlapping_failure_returns_to_idle() {
        let (client, _temp) = setup().await;

        client.begin_sync();
        client.begin_sync();
        client.finish_sync(
            "tickets",
            &Err(ClientError::Http {
                status: 500,
                message: "boom".into(),
            }),
        );
        assert_eq!(client.status(), SyncStatus::Error);

        client.finish_sync("events", &Ok(SyncReport::default()));
        let state = client.state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_aborts_tracked_tasks() {
        let (client, _temp) = setup().await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        client.track_task(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));

        client.disconnect().await;
        // The sender is dropped when the aborted task is torn down
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_server_failure_goes_error() {
        let (client, _temp) = setup().await;
        client.transport().fail(ClientError::Http {
            status: 500,
            message: "boom".into(),
        });

        assert!(client.sync_collection("events", None).await.is_err());
        assert_eq!(client.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_push_then_stale_pull_converges() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));

        let pushed = SyncDocument::from_value(raw_doc("e1", 2, 20)).unwrap();
        assert!(client
            .apply_server_event(ServerEvent::DocumentUpdated(pushed))
            .await
            .unwrap());

        client
            .transport()
            .push(page(vec![raw_doc("e1", 1, 10)], vec![], None));
        let report = client.sync_collection("events", None).await.unwrap();
        assert_eq!(report.stale, 1);

        let doc = client.get_document("events", "e1").await.unwrap().unwrap();
        assert_eq!(doc.version(), 2);
        assert_eq!(*log.lock(), vec!["update:e1:v2"]);
    }

    #[tokio::test]
    async fn test_delete_push_beats_late_update() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));

        let payload = DeletedPayload {
            collection: "events".into(),
            document_id: "e1".into(),
            deleted_at: at(50),
            deleted_by: "alice".into(),
            version: 3,
        };
        client
            .apply_server_event(ServerEvent::DocumentDeleted(payload))
            .await
            .unwrap();

        let late = SyncDocument::from_value(raw_doc("e1", 2, 40)).unwrap();
        assert!(!client
            .apply_server_event(ServerEvent::DocumentUpdated(late))
            .await
            .unwrap());
        assert!(client.get_document("events", "e1").await.unwrap().is_none());
        assert_eq!(*log.lock(), vec!["delete:e1"]);
    }

    #[tokio::test]
    async fn test_push_without_subscription_is_ignored() {
        let (client, _temp) = setup().await;
        let doc = SyncDocument::from_value(raw_doc("e1", 1, 10)).unwrap();
        assert!(!client
            .apply_server_event(ServerEvent::DocumentCreated(doc))
            .await
            .unwrap());
        assert!(client.get_documents("events").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_push_reaches_on_error() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));
        client.subscribe("tickets", log_subscriber(&other));

        // Document without version metadata
        realtime::handle_frame(
            &client,
            r#"{"event":"document:created","payload":{"id":"e1","collection":"events","data":{}}}"#,
        )
        .await;
        assert_eq!(*log.lock(), vec!["error"]);
        assert!(other.lock().is_empty());
        assert!(client.get_documents("events").await.unwrap().is_empty());

        // No collection to attribute it to: every watched collection hears
        realtime::handle_frame(&client, "not json").await;
        assert_eq!(*log.lock(), vec!["error", "error"]);
        assert_eq!(*other.lock(), vec!["error"]);

        let valid = ServerEvent::DocumentCreated(SyncDocument::from_value(raw_doc("e2", 1, 10)).unwrap())
            .to_json()
            .unwrap();
        realtime::handle_frame(&client, &valid).await;
        assert_eq!(log.lock().last().map(String::as_str), Some("update:e2:v1"));
    }

    #[tokio::test]
    async fn test_collection_cleared_notifies_deletes() {
        let (client, _temp) = setup().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        client.subscribe("events", log_subscriber(&log));
        client
            .transport()
            .push(page(vec![raw_doc("e1", 1, 10), raw_doc("e2", 1, 20)], vec![], None));
        client.sync_collection("events", None).await.unwrap();
        log.lock().clear();

        let event = ServerEvent::from_json(r#"{"event":"collection:cleared","payload":{"collection":"events"}}"#)
            .unwrap();
        assert!(client.apply_server_event(event).await.unwrap());
        assert!(client.get_documents("events").await.unwrap().is_empty());
        assert_eq!(*log.lock(), vec!["delete:e1", "delete:e2"]);
    }

    #[tokio::test]
    async fn test_typed_reads() {
        #[derive(Debug, Deserialize)]
        struct Event {
            title: String,
        }

        let (client, _temp) = setup().await;
        client.subscribe("events", Subscriber::new());
        client
            .transport()
            .push(page(vec![raw_doc("e1", 1, 10)], vec![], None));
        client.sync_all().await.unwrap();

        let events = client.get_documents_as::<Event>("events").await.unwrap();
        assert_eq!(events[0].data.title, "Event e1");
    }

    #[tokio::test]
    async fn test_disconnect_clears_subscriptions_and_store() {
        let (client, _temp) = setup().await;
        let subscription = client.subscribe("events", Subscriber::new());

        client.disconnect().await;
        assert!(!subscription.is_active());
        assert!(matches!(
            client.get_documents("events").await,
            Err(ClientError::NotInitialized)
        ));

        // Data survives a re-init.
        client.init().await.unwrap();
        assert!(client.get_documents("events").await.unwrap().is_empty());
    }
}
