//! Field-change feed scoped to one shard
//!
//! Collections subscribe by name and receive every uncommitted field change
//! made to their documents, synchronously with the mutation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::document::FieldChange;

pub trait ChangeListener: Send + Sync {
    fn on_change(&self, change: &FieldChange);
}

type Listeners = Vec<(u64, Arc<dyn ChangeListener>)>;

#[derive(Default)]
pub struct ChangeFeed {
    listeners: RwLock<HashMap<String, Listeners>>,
    next_id: AtomicU64,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for changes in `collection`.
    ///
    /// The listener stays registered until the returned handle is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        collection: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(collection.to_string())
            .or_default()
            .push((id, listener));

        Subscription {
            feed: Arc::downgrade(self),
            collection: collection.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, collection: &str, id: u64) {
        let mut listeners = self.listeners.write();
        if let Some(list) = listeners.get_mut(collection) {
            list.retain(|(listener_id, _)| *listener_id != id);
            if list.is_empty() {
                listeners.remove(collection);
            }
        }
    }

    pub fn publish(&self, collection: &str, change: &FieldChange) {
        // Snapshot so listeners may (un)subscribe while being notified
        let listeners: Vec<Arc<dyn ChangeListener>> = match self.listeners.read().get(collection) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };

        for listener in listeners {
            listener.on_change(change);
        }
    }

    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.listeners
            .read()
            .get(collection)
            .map_or(0, |list| list.len())
    }
}

/// Handle returned by [`ChangeFeed::subscribe`]; unsubscribes on drop
pub struct Subscription {
    feed: Weak<ChangeFeed>,
    collection: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.unsubscribe(&self.collection, self.id);
        }
    }
}
