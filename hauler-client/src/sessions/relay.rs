//! Relay upload session
//!
//! Delegates the upload of a remote file to a worker host. The session
//! negotiates a worker token if the file has none, then attaches to the
//! worker over a persistent channel: bus signals become `pause`/`resume`
//! commands and the worker's `progress`/`error`/`success` messages drive
//! the outcome.

use std::sync::Arc;

use tokio::sync::mpsc;

use hauler_common::{BusEvent, FileId, FileProgress, RemoteSource, UPLOAD_PROTOCOL, UploadFile};

use super::registry::SessionGuard;
use super::{Control, Lifecycle, SessionContext, SessionKind, SessionState, bind_lifecycle};
use crate::config::TransferConfig;
use crate::error::{UploadError, UploadOutcome};
use crate::scope::ListenerScope;
use crate::transport::{
    ChannelCommand, ChannelEvent, ErrorPayload, NegotiationRequest, RelayChannel, RelayConnector,
    WorkerNegotiator, socket_host,
};

const CHANNEL_CLOSED: &str = "worker channel closed before the upload finished";

type Settled = Result<UploadOutcome, UploadError>;

struct RelaySession<'a> {
    ctx: SessionContext<'a>,
    file_id: FileId,
    /// Attached worker channel; None while negotiating and after release
    channel: Option<Box<dyn RelayChannel>>,
    scope: ListenerScope,
    lifecycle: Lifecycle,
    _guard: SessionGuard<'a>,
}

impl RelaySession<'_> {
    fn send(&mut self, command: ChannelCommand) {
        if let Some(channel) = self.channel.as_mut() {
            tracing::trace!(file_id = %self.file_id, command = command.as_str(), "relay command");
            channel.send(command);
        }
    }

    fn pause(&mut self) {
        self.send(ChannelCommand::Pause);
        self.lifecycle.set(self.ctx.sessions, SessionState::Paused);
    }

    fn resume(&mut self) {
        self.send(ChannelCommand::Resume);
        self.lifecycle.set(self.ctx.sessions, SessionState::Running);
    }

    /// Close the channel and drop every subscription; idempotent
    fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.scope.revoke();
    }

    fn settle(&mut self, state: SessionState) {
        self.lifecycle.set(self.ctx.sessions, state);
        self.release();
    }

    fn on_control(&mut self, control: Control) -> Option<Settled> {
        match control {
            Control::Removed => {
                tracing::debug!(file_id = %self.file_id, "file removed during relayed upload");
                self.send(ChannelCommand::Pause);
                self.settle(SessionState::Removed);
                return Some(Ok(UploadOutcome::Removed));
            }
            Control::CancelAll => {
                self.send(ChannelCommand::Pause);
                self.settle(SessionState::Canceled);
                return Some(Ok(UploadOutcome::Canceled));
            }
            Control::Pause { is_paused: true } | Control::PauseAll => self.pause(),
            Control::Pause { is_paused: false } => self.resume(),
            Control::ResumeAll => {
                if self.ctx.file_has_error(&self.file_id) {
                    self.send(ChannelCommand::Pause);
                }
                self.resume();
            }
            Control::Retry => {
                self.send(ChannelCommand::Pause);
                self.resume();
            }
        }
        None
    }

    fn on_event(&mut self, event: ChannelEvent) -> Option<Settled> {
        match event {
            ChannelEvent::Progress(progress) => {
                if progress.progress.as_deref().is_some_and(|p| !p.is_empty()) {
                    tracing::trace!(
                        file_id = %self.file_id,
                        progress = progress.progress.as_deref().unwrap_or_default(),
                        "relay progress"
                    );
                    self.ctx.files.set_progress(
                        &self.file_id,
                        FileProgress {
                            bytes_uploaded: progress.bytes_uploaded,
                            bytes_total: progress.bytes_total,
                        },
                    );
                    self.ctx.bus.emit(BusEvent::UploadProgress {
                        file_id: self.file_id.clone(),
                        bytes_uploaded: progress.bytes_uploaded,
                        bytes_total: progress.bytes_total,
                    });
                }
                None
            }
            ChannelEvent::Error(payload) => Some(Err(self.on_remote_error(payload))),
            ChannelEvent::Success(payload) => {
                self.ctx.bus.emit(BusEvent::UploadSuccess {
                    file_id: self.file_id.clone(),
                    upload_url: payload.url.clone(),
                });
                self.settle(SessionState::Succeeded);
                Some(Ok(UploadOutcome::Completed {
                    upload_url: payload.url,
                }))
            }
        }
    }

    fn on_remote_error(&mut self, payload: ErrorPayload) -> UploadError {
        let message = payload.error.message.clone();
        let cause = serde_json::to_value(&payload.error).ok();

        if self.ctx.options.use_fast_remote_retry {
            // Keep the worker attached so a retry can pick up where it stopped
            if let Some(channel) = self.channel.take() {
                self.ctx
                    .sessions
                    .park_channel(self.ctx.bus, &self.file_id, channel);
            }
        } else {
            // Closing tells the worker to discard its state
            self.release();
            self.ctx.files.set_server_token(&self.file_id, None);
        }

        tracing::warn!(file_id = %self.file_id, error = %message, "relayed upload failed");
        self.ctx.bus.emit(BusEvent::UploadError {
            file_id: self.file_id.clone(),
            error: message.clone(),
        });
        self.settle(SessionState::Failed);
        UploadError::Transfer { message, cause }
    }

    /// Fail without a worker verdict; the token is dropped with the channel
    fn fail_channel(&mut self, message: String) -> UploadError {
        tracing::warn!(file_id = %self.file_id, error = %message, "relay channel failed");
        self.ctx.files.set_server_token(&self.file_id, None);
        let err = UploadError::Channel(message);
        self.ctx.bus.emit(BusEvent::UploadError {
            file_id: self.file_id.clone(),
            error: err.to_string(),
        });
        self.settle(SessionState::Failed);
        err
    }
}

impl Drop for RelaySession<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the request asking a worker host to take over `file`
fn negotiation_request(
    ctx: &SessionContext<'_>,
    file: &UploadFile,
    remote: &RemoteSource,
) -> NegotiationRequest {
    let config = TransferConfig::resolve(ctx.options, file);
    NegotiationRequest {
        url: remote.url.clone(),
        provider: remote.provider.clone(),
        body: remote.body.clone(),
        endpoint: config.endpoint,
        upload_url: config.upload_url,
        protocol: UPLOAD_PROTOCOL.to_string(),
        size: file.size,
        metadata: file.meta.clone(),
    }
}

/// Upload `file` through a remote worker
///
/// Resolves with `Completed`, `Removed` or `Canceled`; rejects when no
/// worker can be negotiated, the channel fails, or the worker reports an
/// error.
pub(crate) async fn run(
    ctx: SessionContext<'_>,
    negotiator: &dyn WorkerNegotiator,
    connector: &dyn RelayConnector,
    file: UploadFile,
) -> Settled {
    let file_id = file.id.clone();
    let Some(remote) = file.remote.clone() else {
        return Err(UploadError::Negotiation(format!(
            "file {file_id} has no remote source"
        )));
    };

    // A worker left in its error state by the previous attempt must restart
    let restart_worker = ctx.sessions.has_parked(&file_id);
    let (ticket, mut superseded) = ctx.sessions.register(&file_id, SessionKind::Relay);
    let guard = SessionGuard::new(ctx.sessions, file_id.clone(), ticket);

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let mut scope = ListenerScope::new(Arc::clone(ctx.bus), file_id.clone());
    bind_lifecycle(&mut scope, ctx.files, control_tx);

    let mut session = RelaySession {
        ctx,
        file_id: file_id.clone(),
        channel: None,
        scope,
        lifecycle: Lifecycle::new(file_id.clone(), ticket),
        _guard: guard,
    };
    let initial = if file.is_paused {
        SessionState::Paused
    } else {
        SessionState::Running
    };
    session.lifecycle.set(ctx.sessions, initial);

    // Phase A: acquire a worker token
    let token = match file.server_token.clone() {
        Some(token) => token,
        None => {
            let request = negotiation_request(&ctx, &file, &remote);
            tracing::debug!(file_id = %file_id, url = %request.url, "requesting remote worker");
            let negotiation = negotiator.negotiate(request);
            tokio::pin!(negotiation);

            let token = loop {
                tokio::select! {
                    biased;

                    _ = &mut superseded => {
                        session.settle(SessionState::Canceled);
                        return Ok(UploadOutcome::Canceled);
                    }

                    Some(control) = control_rx.recv() => {
                        if let Some(outcome) = session.on_control(control) {
                            return outcome;
                        }
                    }

                    result = &mut negotiation => match result {
                        Ok(response) => break response.token,
                        Err(cause) => {
                            tracing::warn!(file_id = %file_id, error = %cause, "worker negotiation failed");
                            session.settle(SessionState::Failed);
                            return Err(UploadError::Negotiation(cause));
                        }
                    },
                }
            };

            if !ctx.files.set_server_token(&file_id, Some(token.clone())) {
                session.settle(SessionState::Removed);
                return Ok(UploadOutcome::Removed);
            }
            token
        }
    };

    // Phase B: attach to the worker
    let target = format!("{}/api/{}", socket_host(&remote.companion_url), token);
    tracing::debug!(file_id = %file_id, target = %target, "attaching to remote worker");
    let mut events = match connector.open(&target) {
        Ok((channel, events)) => {
            session.channel = Some(channel);
            events
        }
        Err(e) => return Err(session.fail_channel(e)),
    };
    if session.lifecycle.state() == SessionState::Paused {
        session.send(ChannelCommand::Pause);
    } else if restart_worker {
        tracing::debug!(file_id = %file_id, "restarting remote worker");
        session.send(ChannelCommand::Pause);
        session.send(ChannelCommand::Resume);
    }

    loop {
        tokio::select! {
            biased;

            _ = &mut superseded => {
                tracing::debug!(file_id = %session.file_id, "relayed upload superseded");
                session.settle(SessionState::Canceled);
                return Ok(UploadOutcome::Canceled);
            }

            Some(control) = control_rx.recv() => {
                if let Some(outcome) = session.on_control(control) {
                    return outcome;
                }
            }

            event = events.recv() => {
                let outcome = match event {
                    Some(event) => session.on_event(event),
                    None => Some(Err(session.fail_channel(CHANNEL_CLOSED.to_string()))),
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
            }
        }
    }
}
