//! Session registry: at most one active session per file
//!
//! Registering a file that already has an active session signals the old
//! session to stop (through a oneshot, so no lock is held while it reacts)
//! and closes any relay channel left parked for the file. Sessions are
//! removed when their guard drops, whatever path the session exits by.
//! A parked channel is also closed when its file is removed, on cancel-all,
//! and when the registry itself is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

use hauler_common::{BusEvent, EventBus, EventName, FileId};

use super::{SessionKind, SessionState};
use crate::scope::ListenerScope;
use crate::transport::RelayChannel;

/// Generation number distinguishing successive sessions for the same file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTicket(u64);

struct ActiveSession {
    ticket: SessionTicket,
    kind: SessionKind,
    state: SessionState,
    /// Taken once when a newer session replaces this one
    supersede_tx: Option<oneshot::Sender<()>>,
}

/// Relay channel kept open after its session failed
struct ParkedChannel {
    channel: Box<dyn RelayChannel>,
    /// Closes the channel if the file goes away first
    _scope: ListenerScope,
}

type ParkedChannels = Mutex<HashMap<FileId, ParkedChannel>>;

/// Tracks the active session of every file
pub struct SessionRegistry {
    sessions: Mutex<HashMap<FileId, ActiveSession>>,
    /// Relay channels kept open after a failure for fast retry
    parked: Arc<ParkedChannels>,
    next_ticket: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            parked: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Register a new session for `file_id`
    ///
    /// Any previous session for the file is told to stop and any parked
    /// channel is closed. The receiver fires if this session is replaced.
    pub fn register(
        &self,
        file_id: &FileId,
        kind: SessionKind,
    ) -> (SessionTicket, oneshot::Receiver<()>) {
        let ticket = SessionTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (supersede_tx, supersede_rx) = oneshot::channel();

        let previous = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(
                file_id.clone(),
                ActiveSession {
                    ticket,
                    kind,
                    state: SessionState::Created,
                    supersede_tx: Some(supersede_tx),
                },
            );

        if let Some(mut previous) = previous
            && let Some(tx) = previous.supersede_tx.take()
        {
            tracing::debug!(file_id = %file_id, "replacing active session");
            let _ = tx.send(());
        }
        self.release_parked(file_id);

        (ticket, supersede_rx)
    }

    /// Remove a session, unless a newer one has already taken its place
    pub fn unregister(&self, file_id: &FileId, ticket: SessionTicket) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        if sessions.get(file_id).is_some_and(|s| s.ticket == ticket) {
            sessions.remove(file_id);
        }
    }

    /// Record a state change for the session holding `ticket`
    pub fn set_state(&self, file_id: &FileId, ticket: SessionTicket, state: SessionState) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        if let Some(session) = sessions.get_mut(file_id)
            && session.ticket == ticket
        {
            session.state = state;
        }
    }

    /// Current state of the file's active session
    pub fn state(&self, file_id: &FileId) -> Option<SessionState> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(file_id)
            .map(|s| s.state)
    }

    /// Kind of the file's active session
    pub fn kind(&self, file_id: &FileId) -> Option<SessionKind> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(file_id)
            .map(|s| s.kind)
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    /// Keep a relay channel open after its session settled
    ///
    /// The channel stays parked until the next attempt for the file, the
    /// file's removal, a cancel-all, or the registry being dropped.
    pub fn park_channel(
        &self,
        bus: &Arc<EventBus>,
        file_id: &FileId,
        channel: Box<dyn RelayChannel>,
    ) {
        let mut scope = ListenerScope::new(Arc::clone(bus), file_id.clone());
        {
            let parked = Arc::downgrade(&self.parked);
            let file_id = file_id.clone();
            scope.on(EventName::FileRemoved, move |event: &BusEvent| {
                if event.file_id() == Some(&file_id) {
                    close_parked(&parked, &file_id);
                }
            });
        }
        {
            let parked = Arc::downgrade(&self.parked);
            let file_id = file_id.clone();
            scope.on(EventName::CancelAll, move |_: &BusEvent| {
                close_parked(&parked, &file_id);
            });
        }

        let replaced = self
            .parked
            .lock()
            .expect("parked channel lock poisoned")
            .insert(
                file_id.clone(),
                ParkedChannel {
                    channel,
                    _scope: scope,
                },
            );
        if let Some(mut old) = replaced {
            old.channel.close();
        }
    }

    /// Close and drop the parked channel for a file
    ///
    /// Returns true if there was one.
    pub fn release_parked(&self, file_id: &FileId) -> bool {
        take_and_close(&self.parked, file_id)
    }

    /// Whether a channel is parked for the file
    pub fn has_parked(&self, file_id: &FileId) -> bool {
        self.parked
            .lock()
            .expect("parked channel lock poisoned")
            .contains_key(file_id)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let parked: Vec<ParkedChannel> = self
            .parked
            .lock()
            .map(|mut parked| parked.drain().map(|(_, p)| p).collect())
            .unwrap_or_default();
        for mut entry in parked {
            entry.channel.close();
        }
    }
}

fn take_and_close(parked: &ParkedChannels, file_id: &FileId) -> bool {
    let entry = parked
        .lock()
        .expect("parked channel lock poisoned")
        .remove(file_id);
    match entry {
        Some(mut entry) => {
            entry.channel.close();
            true
        }
        None => false,
    }
}

fn close_parked(parked: &Weak<ParkedChannels>, file_id: &FileId) {
    if let Some(parked) = parked.upgrade()
        && take_and_close(&parked, file_id)
    {
        tracing::debug!(file_id = %file_id, "closed parked relay channel");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a session when dropped
pub struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    file_id: FileId,
    ticket: SessionTicket,
}

impl<'a> SessionGuard<'a> {
    pub fn new(registry: &'a SessionRegistry, file_id: FileId, ticket: SessionTicket) -> Self {
        Self {
            registry,
            file_id,
            ticket,
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.file_id, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingChannel {
        closed: Arc<AtomicUsize>,
    }

    impl RelayChannel for CountingChannel {
        fn send(&mut self, _command: crate::transport::ChannelCommand) {}

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = SessionRegistry::new();
        let id = FileId::new("f1");

        let (ticket, _rx) = registry.register(&id, SessionKind::Direct);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.state(&id), Some(SessionState::Created));
        assert_eq!(registry.kind(&id), Some(SessionKind::Direct));

        registry.set_state(&id, ticket, SessionState::Running);
        assert_eq!(registry.state(&id), Some(SessionState::Running));

        registry.unregister(&id, ticket);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.state(&id), None);
    }

    #[test]
    fn test_second_register_supersedes_first() {
        let registry = SessionRegistry::new();
        let id = FileId::new("f1");

        let (first, mut first_rx) = registry.register(&id, SessionKind::Relay);
        let (second, mut second_rx) = registry.register(&id, SessionKind::Direct);

        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
        assert_eq!(registry.active_count(), 1);

        // Old session's cleanup must not remove the new one
        registry.unregister(&id, first);
        registry.set_state(&id, first, SessionState::Failed);
        assert_eq!(registry.state(&id), Some(SessionState::Created));

        registry.unregister(&id, second);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = SessionRegistry::new();
        let id = FileId::new("f1");
        let (ticket, _rx) = registry.register(&id, SessionKind::Direct);

        {
            let _guard = SessionGuard::new(&registry, id.clone(), ticket);
            assert_eq!(registry.active_count(), 1);
        }

        assert_eq!(registry.active_count(), 0);
    }

    fn counting(closed: &Arc<AtomicUsize>) -> Box<dyn RelayChannel> {
        Box::new(CountingChannel {
            closed: Arc::clone(closed),
        })
    }

    #[test]
    fn test_register_closes_parked_channel() {
        let bus = Arc::new(EventBus::new());
        let registry = SessionRegistry::new();
        let id = FileId::new("f1");
        let closed = Arc::new(AtomicUsize::new(0));

        registry.park_channel(&bus, &id, counting(&closed));
        assert!(registry.has_parked(&id));

        registry.register(&id, SessionKind::Relay);
        assert!(!registry.has_parked(&id));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Nothing left to release
        assert!(!registry.release_parked(&id));
    }

    #[test]
    fn test_file_removal_closes_parked_channel() {
        let bus = Arc::new(EventBus::new());
        let registry = SessionRegistry::new();
        let id = FileId::new("f1");
        let closed = Arc::new(AtomicUsize::new(0));

        registry.park_channel(&bus, &id, counting(&closed));
        assert_eq!(bus.total_listeners(), 2);

        bus.emit(BusEvent::FileRemoved {
            file_id: FileId::new("other"),
        });
        assert!(registry.has_parked(&id));

        bus.emit(BusEvent::FileRemoved { file_id: id.clone() });
        assert!(!registry.has_parked(&id));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_cancel_all_closes_parked_channels() {
        let bus = Arc::new(EventBus::new());
        let registry = SessionRegistry::new();
        let closed = Arc::new(AtomicUsize::new(0));

        registry.park_channel(&bus, &FileId::new("f1"), counting(&closed));
        registry.park_channel(&bus, &FileId::new("f2"), counting(&closed));

        bus.emit(BusEvent::CancelAll);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(!registry.has_parked(&FileId::new("f1")));
        assert!(!registry.has_parked(&FileId::new("f2")));
    }

    #[test]
    fn test_drop_closes_parked_channels() {
        let bus = Arc::new(EventBus::new());
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let registry = SessionRegistry::new();
            registry.park_channel(&bus, &FileId::new("f1"), counting(&closed));
        }

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.total_listeners(), 0);

        // Handlers outliving the registry are gone, so this reaches nothing
        bus.emit(BusEvent::CancelAll);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
