//! EventBus — synchronous in-process publish/subscribe.
//!
//! `publish` delivers to all current subscribers in subscription order,
//! on the caller's context. A subscriber returning an error is reported
//! via tracing and never propagated to the publisher; later subscribers
//! still run. Nothing is buffered or persisted — the registry, not the
//! event log, is the authoritative state.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::event::Event;

/// Optional per-subscriber filter; `None` receives everything.
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Subscriber callback. Errors are logged by the bus, not escalated.
pub type EventHandler = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Process-wide notification channel. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register a handler, invoked for every event matching `filter`
    /// (or every event when `filter` is `None`).
    pub fn subscribe(&self, filter: Option<EventFilter>, handler: EventHandler) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.inner.subscribers.lock().expect("event bus lock poisoned");
        subscribers.push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }

    /// Remove a subscriber. Returns false if the id was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().expect("event bus lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to all matching subscribers, in subscription
    /// order, synchronously. A publish with zero subscribers is a no-op.
    pub fn publish(&self, event: &Event) {
        let subscribers = self.inner.subscribers.lock().expect("event bus lock poisoned");
        for subscriber in subscribers.iter() {
            if let Some(ref filter) = subscriber.filter
                && !filter(event)
            {
                continue;
            }
            if let Err(e) = (subscriber.handler)(event) {
                warn!(
                    kind = ?event.kind,
                    machine_id = ?event.machine_id,
                    error = %e,
                    "event subscriber failed"
                );
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("event bus lock poisoned").len()
    }
}
