//! Upload orchestrator
//!
//! The `Uploader` takes a batch of files, routes each one to a direct or
//! relayed session, and runs every session through the concurrency gate.
//! All sessions are driven from one `join_all`, so a batch settles when the
//! last file does and one failure never aborts the others.

use std::sync::{Arc, Mutex, Weak};

use futures_util::future::join_all;

use hauler_common::{BusEvent, EventBus, EventName, FileId, FileRegistry, SubscriptionId, UploadFile};

use crate::config::UploaderOptions;
use crate::constants::UNBOUNDED_LIMIT_WARNING;
use crate::error::{FileResult, UploadError, UploadOutcome};
use crate::gate::ConcurrencyGate;
use crate::resumption::ResumptionStore;
use crate::sessions::registry::SessionRegistry;
use crate::sessions::{SessionContext, SessionKind, SessionState, direct, relay};
use crate::transport::{RelayConnector, ResumableTransport, WorkerNegotiator};

/// External collaborators the sessions drive
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn ResumableTransport>,
    pub negotiator: Arc<dyn WorkerNegotiator>,
    pub connector: Arc<dyn RelayConnector>,
}

/// Orchestrates resumable uploads for the files of a host registry
pub struct Uploader {
    options: UploaderOptions,
    bus: Arc<EventBus>,
    files: Arc<FileRegistry>,
    sessions: SessionRegistry,
    gate: ConcurrencyGate,
    collaborators: Collaborators,
    checkpoints: Option<Arc<Mutex<ResumptionStore>>>,
    /// Host-level subscriptions; Some while installed
    installed: Mutex<Option<Vec<SubscriptionId>>>,
}

impl Uploader {
    pub fn new(
        options: UploaderOptions,
        bus: Arc<EventBus>,
        files: Arc<FileRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let gate = ConcurrencyGate::new(options.limit);
        Self {
            options,
            bus,
            files,
            sessions: SessionRegistry::new(),
            gate,
            collaborators,
            checkpoints: None,
            installed: Mutex::new(None),
        }
    }

    /// Persist resumption URLs through `store`
    ///
    /// Records already in the store are copied onto registered files that
    /// have no upload URL yet.
    pub fn with_checkpoints(mut self, store: ResumptionStore) -> Self {
        store.restore_into(&self.files);
        self.checkpoints = Some(Arc::new(Mutex::new(store)));
        self
    }

    // =========================================================================
    // Install / Uninstall
    // =========================================================================

    /// Attach host-level handlers and advertise resumable uploads
    ///
    /// `reset-progress` clears every stored resumption URL. With
    /// `auto_retry`, `back-online` is answered with a `retry-all` broadcast.
    /// Installing twice is a no-op.
    pub fn install(&self) {
        let mut installed = self.installed.lock().expect("install state lock poisoned");
        if installed.is_some() {
            return;
        }

        let mut subscriptions = Vec::new();

        let files = Arc::clone(&self.files);
        let checkpoints = self.checkpoints.clone();
        subscriptions.push(self.bus.on(
            EventName::ResetProgress,
            Arc::new(move |_: &BusEvent| {
                clear_resumption(&files, checkpoints.as_deref());
            }),
        ));

        if self.options.auto_retry {
            let bus: Weak<EventBus> = Arc::downgrade(&self.bus);
            subscriptions.push(self.bus.on(
                EventName::BackOnline,
                Arc::new(move |_: &BusEvent| {
                    if let Some(bus) = bus.upgrade() {
                        tracing::info!("connection restored, retrying uploads");
                        bus.emit(BusEvent::RetryAll);
                    }
                }),
            ));
        }

        tracing::debug!(auto_retry = self.options.auto_retry, "uploader installed");
        *installed = Some(subscriptions);
    }

    /// Remove the handlers added by `install`
    pub fn uninstall(&self) {
        let subscriptions = self
            .installed
            .lock()
            .expect("install state lock poisoned")
            .take();
        if let Some(subscriptions) = subscriptions {
            for id in subscriptions {
                self.bus.off(id);
            }
            tracing::debug!("uploader uninstalled");
        }
    }

    /// Whether resumable uploads are currently advertised
    pub fn resumable_uploads(&self) -> bool {
        self.installed
            .lock()
            .expect("install state lock poisoned")
            .is_some()
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Upload registered files by id
    ///
    /// Ids the registry no longer knows are skipped.
    pub async fn upload(&self, file_ids: &[FileId]) -> Vec<FileResult> {
        let files: Vec<UploadFile> = file_ids
            .iter()
            .filter_map(|id| {
                let file = self.files.get(id);
                if file.is_none() {
                    tracing::debug!(file_id = %id, "skipping unknown file");
                }
                file
            })
            .collect();
        self.upload_files(files).await
    }

    /// Upload a batch and wait for every file to settle
    ///
    /// Results come back in batch order. The batch entries only decide
    /// whether a file is rejected for a pre-existing error; the file is read
    /// again from the registry when its slot frees, so the upload uses its
    /// current state and a file that is not registered by then settles as
    /// `Removed` without any transfer.
    pub async fn upload_files(&self, files: Vec<UploadFile>) -> Vec<FileResult> {
        if files.is_empty() {
            tracing::debug!("no files to upload");
            return Vec::new();
        }
        if self.gate.is_unbounded() {
            tracing::warn!("{UNBOUNDED_LIMIT_WARNING}");
        }
        tracing::debug!(count = files.len(), limit = self.gate.limit(), "uploading batch");

        let actions = files.into_iter().map(|file| {
            let file_id = file.id.clone();
            let scheduled = match file.error.clone() {
                Some(error) => {
                    tracing::debug!(file_id = %file_id, error = %error, "file already failed");
                    Scheduled::Rejected(UploadError::FileError(error))
                }
                None => {
                    self.bus.emit(BusEvent::UploadStarted {
                        file_id: file_id.clone(),
                    });
                    Scheduled::Session
                }
            };
            async move {
                let result = self
                    .gate
                    .run(|| self.run_scheduled(file_id.clone(), scheduled))
                    .await;
                FileResult { file_id, result }
            }
        });

        let results = join_all(actions).await;
        let failed = results.iter().filter(|r| !r.is_ok()).count();
        tracing::debug!(total = results.len(), failed, "batch settled");
        results
    }

    /// Run one scheduled action once it holds a slot
    async fn run_scheduled(
        &self,
        file_id: FileId,
        scheduled: Scheduled,
    ) -> Result<UploadOutcome, UploadError> {
        if let Scheduled::Rejected(error) = scheduled {
            return Err(error);
        }

        // The file may have changed or gone while queued
        let Some(file) = self.files.get(&file_id) else {
            tracing::debug!(file_id = %file_id, "file removed before its upload started");
            return Ok(UploadOutcome::Removed);
        };

        if file.is_remote {
            relay::run(
                self.context(),
                self.collaborators.negotiator.as_ref(),
                self.collaborators.connector.as_ref(),
                file,
            )
            .await
        } else {
            direct::run(self.context(), self.collaborators.transport.as_ref(), file).await
        }
    }

    fn context(&self) -> SessionContext<'_> {
        SessionContext {
            bus: &self.bus,
            files: &self.files,
            sessions: &self.sessions,
            options: &self.options,
            checkpoints: self.checkpoints.as_deref(),
        }
    }

    // =========================================================================
    // Resumption
    // =========================================================================

    /// Forget every stored resumption URL
    ///
    /// Returns the number of files that had one.
    pub fn reset_progress(&self) -> usize {
        clear_resumption(&self.files, self.checkpoints.as_deref())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// State of the file's active session, if it has one
    pub fn session_state(&self, file_id: &FileId) -> Option<SessionState> {
        self.sessions.state(file_id)
    }

    /// Kind of the file's active session, if it has one
    pub fn session_kind(&self, file_id: &FileId) -> Option<SessionKind> {
        self.sessions.kind(file_id)
    }

    /// Number of files with an active session
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    /// Whether a failed relay channel is kept open for the file
    pub fn has_parked_channel(&self, file_id: &FileId) -> bool {
        self.sessions.has_parked(file_id)
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn options(&self) -> &UploaderOptions {
        &self.options
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn files(&self) -> &Arc<FileRegistry> {
        &self.files
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// What a batch entry will do once it gets a slot
enum Scheduled {
    /// Fail with the file's pre-existing error, without any transfer
    Rejected(UploadError),
    /// Start a direct or relayed session
    Session,
}

/// Clear resumption URLs in the registry and the checkpoint store
fn clear_resumption(files: &FileRegistry, checkpoints: Option<&Mutex<ResumptionStore>>) -> usize {
    let cleared = files.clear_upload_urls();
    tracing::debug!(count = cleared.len(), "cleared resumption urls");

    if let Some(store) = checkpoints {
        let mut store = store.lock().expect("checkpoint store lock poisoned");
        store.clear_urls();
        if let Err(e) = store.save() {
            tracing::warn!(error = %e, "failed to save checkpoint");
        }
    }
    cleared.len()
}
