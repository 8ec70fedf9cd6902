//! Per-collection observers.
//!
//! Subscribers are notified in registration order. Callbacks run outside the
//! registry lock, and each one re-checks its subscription's active flag
//! first, so `unsubscribe()` takes effect even in the middle of a fan-out.

use eventsync_core::SyncDocument;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::error::ClientError;

type UpdateFn = Box<dyn Fn(&SyncDocument) + Send + Sync>;
type DeleteFn = Box<dyn Fn(&str) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&ClientError) + Send + Sync>;

/// Callbacks for one collection. All are optional.
#[derive(Default)]
pub struct Subscriber {
    on_update: Option<UpdateFn>,
    on_delete: Option<DeleteFn>,
    on_error: Option<ErrorFn>,
}

impl Subscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with each applied create or update.
    pub fn on_update(mut self, f: impl Fn(&SyncDocument) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    /// Called with the id of each applied deletion.
    pub fn on_delete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

struct Entry {
    id: u64,
    collection: String,
    active: Arc<AtomicBool>,
    subscriber: Arc<Subscriber>,
}

/// Registry of active subscriptions.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(self: &Arc<Self>, collection: &str, subscriber: Subscriber) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.entries.lock().push(Entry {
            id,
            collection: collection.to_string(),
            active: active.clone(),
            subscriber: Arc::new(subscriber),
        });

        Subscription {
            id,
            collection: collection.to_string(),
            active,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Deactivates and drops every subscription.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter() {
            entry.active.store(false, Ordering::SeqCst);
        }
        entries.clear();
    }

    pub fn has_subscribers(&self, collection: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.collection == collection)
    }

    /// Collections with at least one subscriber.
    pub fn collections(&self) -> BTreeSet<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.collection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, collection: &str) -> Vec<(Arc<AtomicBool>, Arc<Subscriber>)> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.collection == collection)
            .map(|e| (e.active.clone(), e.subscriber.clone()))
            .collect()
    }

    fn each(&self, collection: &str, f: impl Fn(&Subscriber)) {
        for (active, subscriber) in self.snapshot(collection) {
            if active.load(Ordering::SeqCst) {
                f(&subscriber);
            }
        }
    }

    pub fn notify_update(&self, doc: &SyncDocument) {
        self.each(&doc.collection, |s| {
            if let Some(f) = &s.on_update {
                f(doc);
            }
        });
    }

    pub fn notify_delete(&self, collection: &str, id: &str) {
        self.each(collection, |s| {
            if let Some(f) = &s.on_delete {
                f(id);
            }
        });
    }

    pub fn notify_error(&self, collection: &str, error: &ClientError) {
        self.each(collection, |s| {
            if let Some(f) = &s.on_error {
                f(error);
            }
        });
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    collection: String,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops delivery immediately. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn doc(collection: &str, id: &str) -> SyncDocument {
        SyncDocument::new(collection, id, json!({}), 1, Utc::now())
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Subscriber) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| {
                let name = name.to_string();
                let log_update = log.clone();
                let log_delete = log.clone();
                let update_name = name.clone();
                Subscriber::new()
                    .on_update(move |d| log_update.lock().push(format!("{}:update:{}", update_name, d.id)))
                    .on_delete(move |id| log_delete.lock().push(format!("{}:delete:{}", name, id)))
            }
        };
        (log, make)
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let registry = Arc::new(Registry::new());
        let (log, make) = recorder();
        registry.subscribe("events", make("first"));
        registry.subscribe("events", make("second"));
        registry.subscribe("notes", make("other"));

        registry.notify_update(&doc("events", "e1"));
        registry.notify_delete("events", "e2");

        assert_eq!(
            *log.lock(),
            vec![
                "first:update:e1",
                "second:update:e1",
                "first:delete:e2",
                "second:delete:e2"
            ]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = Arc::new(Registry::new());
        let (log, make) = recorder();
        let subscription = registry.subscribe("events", make("a"));

        subscription.unsubscribe();
        subscription.unsubscribe();
        registry.notify_update(&doc("events", "e1"));

        assert!(log.lock().is_empty());
        assert!(!subscription.is_active());
        assert!(!registry.has_subscribers("events"));
    }

    #[test]
    fn test_unsubscribe_during_fan_out() {
        let registry = Arc::new(Registry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_in_cb = slot.clone();
        registry.subscribe(
            "events",
            Subscriber::new().on_update(move |_| {
                if let Some(s) = slot_in_cb.lock().as_ref() {
                    s.unsubscribe();
                }
            }),
        );
        let log_cb = log.clone();
        let second = registry.subscribe(
            "events",
            Subscriber::new().on_update(move |d| log_cb.lock().push(d.id.clone())),
        );
        *slot.lock() = Some(second);

        registry.notify_update(&doc("events", "e1"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_clear_deactivates_handles() {
        let registry = Arc::new(Registry::new());
        let (_log, make) = recorder();
        let subscription = registry.subscribe("events", make("a"));

        registry.clear();
        assert!(registry.is_empty());
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_errors_reach_only_their_collection() {
        let registry = Arc::new(Registry::new());
        let errors = Arc::new(Mutex::new(0));
        let counter = errors.clone();
        registry.subscribe(
            "events",
            Subscriber::new().on_error(move |_| *counter.lock() += 1),
        );

        registry.notify_error("events", &ClientError::Protocol("bad".into()));
        registry.notify_error("notes", &ClientError::Protocol("bad".into()));
        assert_eq!(*errors.lock(), 1);
        assert_eq!(registry.collections().len(), 1);
    }
}
