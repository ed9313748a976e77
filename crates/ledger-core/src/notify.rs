//! Change notification bus.
//!
//! The store publishes a [`ChangeEvent`] after every committed mutation and
//! readers (UI data hooks, the sync coordinator's local-change watcher)
//! subscribe to it. Delivery is:
//! - synchronous, on the caller's task, in subscription order
//! - best-effort: a panicking listener is caught and logged, and the write that
//!   triggered the notification still succeeds
//! - uncoalesced: a pull applying fifty rows emits fifty events, and
//!   subscribers debounce if they care

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::models::LocalId;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Synchronous fire-and-forget publish/subscribe bus
pub struct EventBus<E> {
    registry: Arc<RwLock<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Registers a listener until the returned [`Subscription`] is dropped or
    /// explicitly unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = self.registry.write();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let registry: Weak<RwLock<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.write().listeners.retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Delivers `event` to every current listener. Never fails.
    pub fn notify(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<Listener<E>> = self
            .registry
            .read()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("Change listener panicked; notification dropped for it");
            }
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.registry.read().listeners.len()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keeps the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Who caused a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// A user edit made on this device
    Local,
    /// The sync coordinator (push acknowledgement or pulled row)
    Sync,
}

/// A committed change to the entry store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub local_id: LocalId,
}

impl ChangeEvent {
    pub const fn local(local_id: LocalId) -> Self {
        Self {
            origin: ChangeOrigin::Local,
            local_id,
        }
    }

    pub const fn sync(local_id: LocalId) -> Self {
        Self {
            origin: ChangeOrigin::Sync,
            local_id,
        }
    }
}

/// Bus carrying entry store changes
pub type ChangeBus = EventBus<ChangeEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(bus: &EventBus<u32>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let subscription = bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    #[test]
    fn delivers_to_every_listener() {
        let bus = EventBus::<u32>::new();
        let (first, _a) = counter(&bus);
        let (second, _b) = counter(&bus);

        bus.notify(&1);
        bus.notify(&2);

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::<u32>::new();
        let (count, subscription) = counter(&bus);
        assert_eq!(bus.listener_count(), 1);

        drop(subscription);
        bus.notify(&1);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn explicit_unsubscribe_and_detach() {
        let bus = EventBus::<u32>::new();
        let (kept, detached) = counter(&bus);
        let (removed, subscription) = counter(&bus);

        detached.detach();
        subscription.unsubscribe();
        bus.notify(&1);

        assert_eq!(kept.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_reach_publisher() {
        let bus = EventBus::<u32>::new();
        let _bad = bus.subscribe(|_| panic!("listener bug"));
        let (count, _good) = counter(&bus);

        bus.notify(&1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_delivery() {
        let bus = EventBus::<u32>::new();
        let slot: Arc<parking_lot::Mutex<Option<Subscription>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let inner = Arc::clone(&slot);
        let subscription = bus.subscribe(move |_| {
            inner.lock().take();
        });
        *slot.lock() = Some(subscription);

        bus.notify(&1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn change_event_constructors() {
        let id = LocalId::generate();
        assert_eq!(ChangeEvent::local(id.clone()).origin, ChangeOrigin::Local);
        assert_eq!(ChangeEvent::sync(id).origin, ChangeOrigin::Sync);
    }
}
