//! Watcher registry.
//!
//! The registry outlives a single connection: [`Client`](crate::Client)
//! hands the same registry to every connection it creates, so that
//! subscriptions are replayed after a reconnect.

use iproto_protocol::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
struct WatchEntry {
    consumers: Vec<(u64, mpsc::UnboundedSender<Event>)>,
    /// Subscribed by the connection itself (e.g. `box.shutdown`).
    internal: bool,
    /// Whether an event has been seen on the current connection.
    acked: bool,
}

impl WatchEntry {
    fn is_empty(&self) -> bool {
        self.consumers.is_empty() && !self.internal
    }
}

/// Registered watcher keys and their consumers.
#[derive(Default)]
pub struct WatcherRegistry {
    entries: Mutex<HashMap<String, WatchEntry>>,
    next_id: AtomicU64,
}

/// Result of dispatching an event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// The key is registered; the server expects an acknowledgement.
    Delivered,
    /// Nobody watches the key (unwatched while the event was in flight).
    Unwatched,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer for `key`. Returns the receiver and whether the key
    /// was not registered before.
    pub(crate) fn register(&self, key: &str) -> (WatchStream, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut entries = self.entries.lock();
        let first = !entries.contains_key(key);
        entries
            .entry(key.to_string())
            .or_default()
            .consumers
            .push((id, tx));

        (
            WatchStream {
                key: key.to_string(),
                rx,
            },
            first,
        )
    }

    /// Registers a key the connection consumes itself. Returns whether the
    /// key was not registered before.
    pub(crate) fn register_internal(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let first = !entries.contains_key(key);
        entries.entry(key.to_string()).or_default().internal = true;
        first
    }

    /// Removes every consumer of `key`. Returns whether the key is no longer
    /// registered at all and must be unsubscribed on the server.
    pub(crate) fn unregister(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.consumers.clear();
                if entry.is_empty() {
                    entries.remove(key);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Delivers an event to every consumer of its key, in arrival order.
    pub(crate) fn dispatch(&self, event: &Event) -> Dispatch {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&event.key) else {
            return Dispatch::Unwatched;
        };
        entry.acked = true;
        entry
            .consumers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        Dispatch::Delivered
    }

    /// Keys to subscribe on a fresh connection. Resets acknowledgement state.
    pub(crate) fn keys_for_resubscribe(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        entries.values_mut().for_each(|entry| entry.acked = false);
        entries.keys().cloned().collect()
    }

    /// Whether at least one event for `key` arrived on the current connection.
    pub fn is_acked(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.acked)
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Events for one watched key.
#[derive(Debug)]
pub struct WatchStream {
    key: String,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl WatchStream {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Receives the next event. Returns `None` once the key is unwatched.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
