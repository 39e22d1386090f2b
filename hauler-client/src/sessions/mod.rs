//! Upload sessions
//!
//! A session is one upload attempt for one file, either run here against the
//! upload endpoint (`direct`) or delegated to a remote worker (`relay`).
//! Both kinds share the lifecycle plumbing in this module: the state
//! machine, the bus signals they react to, and the context they run in.
//!
//! ## Module Structure
//!
//! - `registry` - file id to active session mapping, parked relay channels
//! - `direct` - local resumable upload
//! - `relay` - upload performed by a remote worker

pub(crate) mod direct;
pub(crate) mod registry;
pub(crate) mod relay;

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use hauler_common::{BusEvent, EventBus, EventName, FileId, FileRegistry};

use crate::config::UploaderOptions;
use crate::resumption::ResumptionStore;
use crate::scope::ListenerScope;

use registry::{SessionRegistry, SessionTicket};

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
    Removed,
}

impl SessionState {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Removed
        )
    }

    /// Whether moving to `next` is allowed
    ///
    /// `Paused -> Running` is the only way back; a session may also begin
    /// paused.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Self::Created) => false,
            (Self::Created, _) => true,
            (Self::Running, Self::Running) => false,
            (Self::Paused, Self::Paused) => false,
            _ => true,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Which upload path a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Direct,
    Relay,
}

/// Session state mirrored into the registry
pub(crate) struct Lifecycle {
    file_id: FileId,
    ticket: SessionTicket,
    state: SessionState,
}

impl Lifecycle {
    pub(crate) fn new(file_id: FileId, ticket: SessionTicket) -> Self {
        Self {
            file_id,
            ticket,
            state: SessionState::Created,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if allowed; returns whether the state changed
    pub(crate) fn set(&mut self, sessions: &SessionRegistry, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        tracing::trace!(file_id = %self.file_id, from = %self.state, to = %next, "session state");
        self.state = next;
        sessions.set_state(&self.file_id, self.ticket, next);
        true
    }
}

// =============================================================================
// Lifecycle Signals
// =============================================================================

/// Lifecycle signal addressed to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Removed,
    Pause { is_paused: bool },
    PauseAll,
    CancelAll,
    ResumeAll,
    Retry,
}

/// Subscribe a session to the bus signals that concern its file
///
/// Handlers only forward into the session's control channel. Broadcast
/// signals are ignored once the file is gone from the registry.
pub(crate) fn bind_lifecycle(
    scope: &mut ListenerScope,
    files: &Arc<FileRegistry>,
    control_tx: mpsc::UnboundedSender<Control>,
) {
    let file_id = scope.file_id().clone();

    let for_file = |tx: &mpsc::UnboundedSender<Control>, control: fn(&BusEvent) -> Option<Control>| {
        let tx = tx.clone();
        let file_id = file_id.clone();
        move |event: &BusEvent| {
            if event.file_id() == Some(&file_id)
                && let Some(control) = control(event)
            {
                let _ = tx.send(control);
            }
        }
    };
    let broadcast = |tx: &mpsc::UnboundedSender<Control>, control: Control| {
        let tx = tx.clone();
        let file_id = file_id.clone();
        let files = Arc::clone(files);
        move |_: &BusEvent| {
            if files.contains(&file_id) {
                let _ = tx.send(control);
            }
        }
    };

    scope.on(
        EventName::FileRemoved,
        for_file(&control_tx, |_| Some(Control::Removed)),
    );
    scope.on(
        EventName::UploadPause,
        for_file(&control_tx, |event| match event {
            BusEvent::UploadPause { is_paused, .. } => Some(Control::Pause {
                is_paused: *is_paused,
            }),
            _ => None,
        }),
    );
    scope.on(
        EventName::UploadRetry,
        for_file(&control_tx, |_| Some(Control::Retry)),
    );
    scope.on(
        EventName::PauseAll,
        broadcast(&control_tx, Control::PauseAll),
    );
    scope.on(
        EventName::CancelAll,
        broadcast(&control_tx, Control::CancelAll),
    );
    scope.on(
        EventName::ResumeAll,
        broadcast(&control_tx, Control::ResumeAll),
    );
    scope.on(EventName::RetryAll, broadcast(&control_tx, Control::Retry));
}

// =============================================================================
// Session Context
// =============================================================================

/// Shared state a session runs against
#[derive(Clone, Copy)]
pub(crate) struct SessionContext<'a> {
    pub bus: &'a Arc<EventBus>,
    pub files: &'a Arc<FileRegistry>,
    pub sessions: &'a SessionRegistry,
    pub options: &'a UploaderOptions,
    pub checkpoints: Option<&'a Mutex<ResumptionStore>>,
}

impl SessionContext<'_> {
    /// Store the resumable-session URL for a file if it changed
    ///
    /// A missing URL never clears a recorded one.
    pub(crate) fn record_upload_url(&self, file_id: &FileId, url: Option<String>) {
        let Some(url) = url else {
            return;
        };
        let Some(file) = self.files.get(file_id) else {
            return;
        };
        if file.upload_url() == Some(url.as_str()) {
            return;
        }

        tracing::debug!(file_id = %file_id, url = %url, "storing upload url");
        self.files.set_upload_url(file_id, url.clone());

        if let Some(store) = self.checkpoints {
            let mut store = store.lock().expect("checkpoint store lock poisoned");
            store.record(file_id, url);
            if let Err(e) = store.save() {
                tracing::warn!(file_id = %file_id, error = %e, "failed to save checkpoint");
            }
        }
    }

    /// Whether the file currently carries an error marker
    pub(crate) fn file_has_error(&self, file_id: &FileId) -> bool {
        self.files
            .get(file_id)
            .is_some_and(|file| file.error.is_some())
    }
}
