//! Direct upload session
//!
//! Runs one resumable-upload attempt for a local file against the upload
//! endpoint. The transfer collaborator does the protocol work; this session
//! translates bus signals into `start`/`abort` calls, records the
//! resumable-session URL as progress is confirmed, and settles exactly once.

use std::sync::Arc;

use tokio::sync::mpsc;

use hauler_common::{BusEvent, FileId, FileProgress, UploadFile};

use super::registry::SessionGuard;
use super::{Control, Lifecycle, SessionContext, SessionKind, SessionState, bind_lifecycle};
use crate::config::TransferConfig;
use crate::error::{UploadError, UploadOutcome};
use crate::scope::ListenerScope;
use crate::transport::{ResumableTransport, TransferEvent, TransferHandle};

/// Message used when the transfer stops reporting without a result
const TRANSFER_VANISHED: &str = "transfer ended without a result";

struct DirectSession<'a> {
    ctx: SessionContext<'a>,
    file_id: FileId,
    handle: Option<Box<dyn TransferHandle>>,
    scope: ListenerScope,
    lifecycle: Lifecycle,
    _guard: SessionGuard<'a>,
}

impl DirectSession<'_> {
    fn start(&mut self) {
        if self.lifecycle.state() == SessionState::Running {
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.start();
        }
        self.lifecycle.set(self.ctx.sessions, SessionState::Running);
    }

    fn pause(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.abort();
        }
        self.lifecycle.set(self.ctx.sessions, SessionState::Paused);
    }

    fn upload_url(&self) -> Option<String> {
        self.handle.as_ref().and_then(|h| h.url())
    }

    /// Abort the transfer and drop every subscription; idempotent
    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.abort();
        }
        self.scope.revoke();
        self.ctx.sessions.release_parked(&self.file_id);
    }

    fn settle(&mut self, state: SessionState) {
        self.lifecycle.set(self.ctx.sessions, state);
        self.release();
    }

    /// React to a lifecycle signal; returns the outcome if it ends the session
    fn on_control(&mut self, control: Control) -> Option<Result<UploadOutcome, UploadError>> {
        match control {
            Control::Removed => {
                tracing::debug!(file_id = %self.file_id, "file removed during upload");
                self.settle(SessionState::Removed);
                return Some(Ok(UploadOutcome::Removed));
            }
            Control::CancelAll => {
                self.settle(SessionState::Canceled);
                return Some(Ok(UploadOutcome::Canceled));
            }
            Control::Pause { is_paused: true } | Control::PauseAll => self.pause(),
            Control::Pause { is_paused: false } => self.start(),
            Control::ResumeAll => {
                // A failed transfer has to be torn down before it can restart
                if self.ctx.file_has_error(&self.file_id) {
                    self.pause();
                }
                self.start();
            }
            Control::Retry => {}
        }
        None
    }

    fn on_event(&mut self, event: TransferEvent) -> Option<Result<UploadOutcome, UploadError>> {
        match event {
            TransferEvent::Progress {
                bytes_uploaded,
                bytes_total,
            } => {
                self.ctx.record_upload_url(&self.file_id, self.upload_url());
                self.ctx.files.set_progress(
                    &self.file_id,
                    FileProgress {
                        bytes_uploaded,
                        bytes_total,
                    },
                );
                self.ctx.bus.emit(BusEvent::UploadProgress {
                    file_id: self.file_id.clone(),
                    bytes_uploaded,
                    bytes_total,
                });
                None
            }
            TransferEvent::Success => {
                let upload_url = self.upload_url();
                self.ctx.bus.emit(BusEvent::UploadSuccess {
                    file_id: self.file_id.clone(),
                    upload_url: upload_url.clone(),
                });
                if let Some(url) = &upload_url {
                    let name = self
                        .ctx
                        .files
                        .get(&self.file_id)
                        .map(|f| f.name().to_string())
                        .unwrap_or_else(|| self.file_id.to_string());
                    tracing::info!(file_id = %self.file_id, "Download {name} from {url}");
                }
                self.settle(SessionState::Succeeded);
                Some(Ok(UploadOutcome::Completed { upload_url }))
            }
            TransferEvent::Error { message } => Some(Err(self.fail(message))),
        }
    }

    fn fail(&mut self, message: String) -> UploadError {
        tracing::warn!(file_id = %self.file_id, error = %message, "direct upload failed");
        self.ctx.bus.emit(BusEvent::UploadError {
            file_id: self.file_id.clone(),
            error: message.clone(),
        });
        self.settle(SessionState::Failed);
        UploadError::transfer(message)
    }
}

impl Drop for DirectSession<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Upload `file` through the resumable transfer collaborator
///
/// Resolves with `Completed`, `Removed` or `Canceled`; rejects with a
/// transfer error after emitting `upload-error`.
pub(crate) async fn run(
    ctx: SessionContext<'_>,
    transport: &dyn ResumableTransport,
    file: UploadFile,
) -> Result<UploadOutcome, UploadError> {
    let file_id = file.id.clone();
    let (ticket, mut superseded) = ctx.sessions.register(&file_id, SessionKind::Direct);
    let guard = SessionGuard::new(ctx.sessions, file_id.clone(), ticket);

    let config = TransferConfig::resolve(ctx.options, &file);
    tracing::debug!(
        file_id = %file_id,
        endpoint = %config.endpoint,
        fingerprint = %config.fingerprint,
        resume_from = ?config.upload_url,
        "creating direct upload"
    );
    let (handle, mut events) = transport.create(file.data.clone(), config);

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let mut scope = ListenerScope::new(Arc::clone(ctx.bus), file_id.clone());
    bind_lifecycle(&mut scope, ctx.files, control_tx);

    let mut session = DirectSession {
        ctx,
        file_id: file_id.clone(),
        handle: Some(handle),
        scope,
        lifecycle: Lifecycle::new(file_id, ticket),
        _guard: guard,
    };

    if file.is_paused {
        session
            .lifecycle
            .set(ctx.sessions, SessionState::Paused);
    } else {
        session.start();
    }

    loop {
        tokio::select! {
            biased;

            _ = &mut superseded => {
                tracing::debug!(file_id = %session.file_id, "direct upload superseded");
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
                    None => Some(Err(session.fail(TRANSFER_VANISHED.to_string()))),
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
            }
        }
    }
}
