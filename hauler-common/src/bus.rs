//! Shared signal bus
//!
//! A small synchronous pub/sub hub. Handlers are invoked on the emitting
//! task, after the handler list lock has been released, so a handler may
//! itself emit or unsubscribe without deadlocking.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::{BusEvent, EventName};

/// Callback invoked for every event of the subscribed name
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Identifier returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    name: EventName,
    handler: Handler,
}

/// Named-event bus shared by the host and every upload session
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to events named `name`
    pub fn on(&self, name: EventName, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscription { id, name, handler });
        id
    }

    /// Remove a subscription
    ///
    /// Returns false if it was already removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock().expect("event bus lock poisoned");
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver an event to every handler subscribed to its name
    ///
    /// Handlers run in subscription order.
    pub fn emit(&self, event: BusEvent) {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .iter()
            .filter(|s| s.name == name)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        tracing::trace!(event = %name, handlers = handlers.len(), "emit");

        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of handlers currently subscribed to `name`
    pub fn listener_count(&self, name: EventName) -> usize {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .iter()
            .filter(|s| s.name == name)
            .count()
    }

    /// Total number of live subscriptions
    pub fn total_listeners(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}
