//! In-process pub/sub bus for FieldSync
//!
//! Distributes immutable state snapshots to any number of observers without
//! polling. Delivery is synchronous and in subscriber-registration order; a
//! panicking subscriber is isolated and logged so the remaining subscribers
//! still receive the value.
//!
//! The bus is a plain owned value, not a global: each engine instance (or
//! test) constructs its own, so multiple instances coexist without collision.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Registry<T> {
    subscribers: RwLock<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Pub/sub bus carrying cloneable snapshot values.
pub struct EventBus<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber. The returned guard unsubscribes on drop.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .subscribers
            .write()
            .push((id, Arc::new(callback)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Deliver `value` to every live subscriber, in registration order.
    ///
    /// Best-effort: a subscriber that panics does not prevent delivery to the
    /// subscribers registered after it.
    pub fn publish(&self, value: &T) {
        // Snapshot the list so a callback may subscribe or unsubscribe
        // without deadlocking on the registry lock.
        let subscribers: Vec<(u64, Callback<T>)> = self
            .registry
            .subscribers
            .read()
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();
        for (id, callback) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                tracing::warn!(subscriber_id = id, "subscriber panicked during delivery");
            }
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.read().len()
    }
}

/// Guard for a single subscription; dropping it removes the subscriber.
pub struct Subscription<T> {
    registry: Weak<Registry<T>>,
    id: u64,
}

impl<T> Subscription<T> {
    /// Remove the subscriber immediately instead of waiting for drop.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}
