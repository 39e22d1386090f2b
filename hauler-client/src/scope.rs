//! Per-file listener scope
//!
//! Records every bus subscription made on behalf of one file so they can be
//! revoked together. Stale handlers from a finished upload must never fire
//! for later operations on the same bus.

use std::sync::Arc;

use hauler_common::{BusEvent, EventBus, EventName, FileId, SubscriptionId};

/// Subscriptions owned by a single file's session
pub struct ListenerScope {
    bus: Arc<EventBus>,
    file_id: FileId,
    subscriptions: Vec<SubscriptionId>,
}

impl ListenerScope {
    /// Create an empty scope for `file_id`
    pub fn new(bus: Arc<EventBus>, file_id: FileId) -> Self {
        Self {
            bus,
            file_id,
            subscriptions: Vec::new(),
        }
    }

    /// Subscribe `handler` and remember the subscription
    pub fn on<F>(&mut self, name: EventName, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.bus.on(name, Arc::new(handler));
        self.subscriptions.push(id);
    }

    /// Remove every subscription made through this scope
    ///
    /// Safe to call repeatedly.
    pub fn revoke(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        tracing::trace!(
            file_id = %self.file_id,
            count = self.subscriptions.len(),
            "revoking listeners"
        );
        for id in self.subscriptions.drain(..) {
            self.bus.off(id);
        }
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }
}

impl Drop for ListenerScope {
    fn drop(&mut self) {
        self.revoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_revoke_removes_only_own_subscriptions() {
        let bus = Arc::new(EventBus::new());
        let foreign = bus.on(EventName::PauseAll, Arc::new(|_: &BusEvent| {}));

        let mut scope = ListenerScope::new(Arc::clone(&bus), FileId::new("f1"));
        scope.on(EventName::PauseAll, |_| {});
        scope.on(EventName::CancelAll, |_| {});
        assert_eq!(scope.len(), 2);
        assert_eq!(bus.total_listeners(), 3);

        scope.revoke();
        assert!(scope.is_empty());
        assert_eq!(bus.total_listeners(), 1);
        assert!(bus.off(foreign));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let mut scope = ListenerScope::new(Arc::clone(&bus), FileId::new("f1"));

        // Empty scope
        scope.revoke();

        scope.on(EventName::ResumeAll, |_| {});
        scope.revoke();
        scope.revoke();
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_drop_revokes() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let mut scope = ListenerScope::new(Arc::clone(&bus), FileId::new("f1"));
            let hits = Arc::clone(&hits);
            scope.on(EventName::RetryAll, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            bus.emit(BusEvent::RetryAll);
        }

        bus.emit(BusEvent::RetryAll);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.total_listeners(), 0);
    }
}
