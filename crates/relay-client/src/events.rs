//! Ordered event fan-out with revocable listeners.
//!
//! A hub delivers each published event to the listeners attached at that
//! moment, in publish order. Late listeners see only later events.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Listener<T> {
    Callback(Callback<T>),
    Channel(mpsc::UnboundedSender<T>),
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(f) => Self::Callback(Arc::clone(f)),
            Self::Channel(tx) => Self::Channel(tx.clone()),
        }
    }
}

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

impl<T> Listeners<T> {
    fn insert(&mut self, listener: Listener<T>) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, listener));
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry, _)| *entry != id);
    }
}

/// Fan-out point for one event type.
pub struct EventHub<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callback. It stays attached until the handle is revoked.
    pub fn on(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerHandle {
        let id = self.listeners.lock().insert(Listener::Callback(Arc::new(handler)));
        HandlerHandle::new(Arc::downgrade(&self.listeners), id)
    }

    /// Attach a channel. Dropping the subscription detaches it.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.listeners.lock().insert(Listener::Channel(tx));
        Subscription { rx }
    }

    /// Deliver `event` to every current listener. Returns how many got it.
    pub fn publish(&self, event: &T) -> usize {
        // Deliver outside the lock so callbacks may attach or revoke.
        let snapshot = self.listeners.lock().entries.clone();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, listener) in snapshot {
            match listener {
                Listener::Callback(f) => {
                    f(event);
                    delivered += 1;
                }
                Listener::Channel(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut listeners = self.listeners.lock();
            for id in closed {
                listeners.remove(id);
            }
        }
        delivered
    }

    /// Listeners currently attached, including closed channels not yet pruned.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

/// Revocation handle for a callback attached with [`EventHub::on`].
pub struct HandlerHandle {
    revoke: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HandlerHandle {
    fn new<T: Send + 'static>(listeners: Weak<Mutex<Listeners<T>>>, id: u64) -> Self {
        let revoke = move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().remove(id);
            }
        };
        Self {
            revoke: Mutex::new(Some(Box::new(revoke))),
        }
    }

    /// Detach the callback. Later calls do nothing.
    pub fn revoke(&self) {
        let revoke = self.revoke.lock().take();
        if let Some(revoke) = revoke {
            revoke();
        }
    }

    /// Whether [`revoke`](Self::revoke) has run.
    pub fn is_revoked(&self) -> bool {
        self.revoke.lock().is_none()
    }
}

/// Ordered stream of events from an [`EventHub`].
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_receive_in_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = hub.on(move |n| sink.lock().push(*n));
        for n in 1..=3 {
            assert_eq!(hub.publish(&n), 1);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn revoked_handler_gets_nothing_more() {
        let hub = EventHub::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = hub.on(move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        let _ = hub.publish(&1);
        handle.revoke();
        handle.revoke();
        assert!(handle.is_revoked());
        let _ = hub.publish(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn late_subscriber_sees_only_later_events() {
        let hub = EventHub::<&'static str>::new();
        let _ = hub.publish(&"early");
        let mut sub = hub.subscribe();
        let _ = hub.publish(&"late");
        assert_eq!(sub.try_recv(), Some("late"));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let hub = EventHub::<u8>::new();
        let sub = hub.subscribe();
        assert_eq!(hub.listener_count(), 1);
        drop(sub);
        assert_eq!(hub.publish(&1), 0);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn handler_may_revoke_itself_during_delivery() {
        let hub = EventHub::<u8>::new();
        let slot: Arc<Mutex<Option<HandlerHandle>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let handle = hub.on(move |_| {
            if let Some(h) = inner.lock().as_ref() {
                h.revoke();
            }
        });
        *slot.lock() = Some(handle);
        assert_eq!(hub.publish(&1), 1);
        assert_eq!(hub.publish(&2), 0);
    }

    #[test]
    fn revoke_after_hub_dropped_is_harmless() {
        let hub = EventHub::<u8>::new();
        let handle = hub.on(|_| {});
        drop(hub);
        handle.revoke();
        assert!(handle.is_revoked());
    }

    #[tokio::test]
    async fn subscription_recv_awaits_next_event() {
        let hub = Arc::new(EventHub::<u32>::new());
        let mut sub = hub.subscribe();
        let publisher = Arc::clone(&hub);
        let _ = tokio::spawn(async move {
            let _ = publisher.publish(&7);
        });
        assert_eq!(sub.recv().await, Some(7));
    }
}
