//! Change notification bus.
//!
//! Tracks live subscriptions per collection and wakes them when the local
//! store changes. Tabs running in the same process share one bus, so a write
//! in one tab reaches subscribers in every other. The bus also carries
//! [`SyncEvent`]s and a local-write counter the coordinator waits on.

use std::sync::Arc;

use dashmap::DashMap;
use tether_engine::CollectionName;
use tokio::sync::{broadcast, mpsc, watch};

use crate::events::SyncEvent;

/// Sender half handed to a subscription.
pub type ChangeSender = mpsc::UnboundedSender<CollectionName>;

const EVENT_CAPACITY: usize = 256;

/// A single subscription.
#[derive(Debug)]
struct Subscriber {
    collection: CollectionName,
    sender: ChangeSender,
}

/// Fans out change notifications and sync events.
///
/// Thread-safe and can be shared across tabs via `Arc`.
#[derive(Debug)]
pub struct ChangeBus {
    /// All live subscriptions, keyed by subscription id.
    subscribers: DashMap<String, Subscriber>,
    /// Index of subscriptions by collection.
    by_collection: DashMap<CollectionName, Vec<String>>,
    events: broadcast::Sender<SyncEvent>,
    local_writes: watch::Sender<u64>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (local_writes, _) = watch::channel(0);
        Self {
            subscribers: DashMap::new(),
            by_collection: DashMap::new(),
            events,
            local_writes,
        }
    }

    /// Create a new bus wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscription to `collection`.
    ///
    /// Returns the subscription ID.
    pub fn register(&self, collection: &str, sender: ChangeSender) -> String {
        let sub_id = uuid::Uuid::new_v4().to_string();

        self.subscribers.insert(
            sub_id.clone(),
            Subscriber {
                collection: collection.to_string(),
                sender,
            },
        );
        self.by_collection
            .entry(collection.to_string())
            .or_default()
            .push(sub_id.clone());

        tracing::debug!(sub_id = %sub_id, collection, "Subscription registered");

        sub_id
    }

    /// Unregister a subscription.
    pub fn unregister(&self, sub_id: &str) {
        if let Some((_, sub)) = self.subscribers.remove(sub_id) {
            if let Some(mut ids) = self.by_collection.get_mut(&sub.collection) {
                ids.retain(|id| id != sub_id);
                if ids.is_empty() {
                    drop(ids);
                    self.by_collection.remove(&sub.collection);
                }
            }

            tracing::debug!(
                sub_id = %sub_id,
                collection = %sub.collection,
                "Subscription unregistered"
            );
        }
    }

    /// Wake every subscriber of `collection`.
    ///
    /// Returns the number of subscriptions notified.
    pub fn notify(&self, collection: &str) -> usize {
        let Some(ids) = self.by_collection.get(collection).map(|ids| ids.clone()) else {
            return 0;
        };

        let mut sent = 0;
        for id in ids {
            if let Some(sub) = self.subscribers.get(&id) {
                if sub.sender.send(collection.to_string()).is_ok() {
                    sent += 1;
                }
            }
        }

        tracing::trace!(collection, recipients = sent, "Change notified");
        sent
    }

    /// Publish a sync event. Having no listeners is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Signal that a local write queued a new operation.
    pub fn local_write(&self) {
        self.local_writes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Observe local writes; the value is a running counter.
    pub fn watch_local_writes(&self) -> watch::Receiver<u64> {
        self.local_writes.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn collection_count(&self) -> usize {
        self.by_collection.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let bus = ChangeBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let sub_id = bus.register("tasks", tx);
        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(bus.collection_count(), 1);

        bus.unregister(&sub_id);
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(bus.collection_count(), 0);
    }

    #[test]
    fn test_notify_only_reaches_collection() {
        let bus = ChangeBus::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.register("tasks", tx1);
        bus.register("announcements", tx2);

        assert_eq!(bus.notify("tasks"), 1);
        assert_eq!(rx1.try_recv().unwrap(), "tasks");
        assert!(rx2.try_recv().is_err());
        assert_eq!(bus.notify("users"), 0);
    }

    #[test]
    fn test_dropped_receiver_is_skipped() {
        let bus = ChangeBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register("tasks", tx);
        drop(rx);

        assert_eq!(bus.notify("tasks"), 0);
    }

    #[test]
    fn test_local_write_counter() {
        let bus = ChangeBus::new();
        let mut rx = bus.watch_local_writes();
        bus.local_write();
        bus.local_write();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);
    }
}
