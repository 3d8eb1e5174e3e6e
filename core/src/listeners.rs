//! Fan-out registry for push events.
//!
//! Owned by the transport session and torn down on `disconnect()`. Every
//! `add` hands back a [`Subscription`]; dropping it deregisters the callback.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::event::PushEvent;

pub type Listener = Arc<dyn Fn(&PushEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener)>>,
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Registry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver one event to every listener.
    ///
    /// Listeners run outside the registry lock, so a callback may add or drop
    /// subscriptions without deadlocking.
    pub fn dispatch(&self, event: &PushEvent) {
        let snapshot: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.inner.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle returned by [`ListenerRegistry::add`].
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RideId;
    use std::sync::atomic::AtomicUsize;

    fn counter(registry: &ListenerRegistry) -> (Arc<AtomicUsize>, Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let sub = registry.add(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, sub)
    }

    #[test]
    fn test_fan_out_to_independent_listeners() {
        let registry = ListenerRegistry::new();
        let (a, _sub_a) = counter(&registry);
        let (b, sub_b) = counter(&registry);

        registry.dispatch(&PushEvent::Closed { ride_id: RideId(1) });
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        sub_b.unsubscribe();
        registry.dispatch(&PushEvent::Closed { ride_id: RideId(1) });
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_drops_everything_and_late_unsubscribe_is_harmless() {
        let registry = ListenerRegistry::new();
        let (hits, sub) = counter(&registry);
        registry.clear();
        assert!(registry.is_empty());

        registry.dispatch(&PushEvent::Closed { ride_id: RideId(1) });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(sub);
        drop(registry);
    }

    #[test]
    fn test_listener_may_subscribe_during_dispatch() {
        let registry = ListenerRegistry::new();
        let nested = registry.clone();
        let added = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let added_in = Arc::clone(&added);
        let _sub = registry.add(move |_| {
            added_in.lock().push(nested.add(|_| {}));
        });

        registry.dispatch(&PushEvent::Closed { ride_id: RideId(1) });
        assert_eq!(registry.len(), 2);
    }
}
