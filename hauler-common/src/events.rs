//! Named events carried on the signal bus
//!
//! Lifecycle signals flow from the host to the upload core; upload
//! notifications flow back. Both share one bus and one naming scheme so
//! subscriptions can be made by name.

use std::fmt;

use crate::file::FileId;

/// Name of an event on the bus
///
/// The string forms match the names hosts already use for these signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// A file was removed from the registry
    FileRemoved,
    /// A single file was paused or resumed
    UploadPause,
    PauseAll,
    CancelAll,
    ResumeAll,
    /// A single file should be retried
    UploadRetry,
    RetryAll,
    /// Network connectivity came back
    BackOnline,
    /// Recorded resumption URLs should be discarded
    ResetProgress,
    UploadStarted,
    UploadProgress,
    UploadError,
    UploadSuccess,
}

impl EventName {
    /// Convert to the string representation used by hosts
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRemoved => "file-removed",
            Self::UploadPause => "upload-pause",
            Self::PauseAll => "pause-all",
            Self::CancelAll => "cancel-all",
            Self::ResumeAll => "resume-all",
            Self::UploadRetry => "upload-retry",
            Self::RetryAll => "retry-all",
            Self::BackOnline => "back-online",
            Self::ResetProgress => "reset-progress",
            Self::UploadStarted => "upload-started",
            Self::UploadProgress => "upload-progress",
            Self::UploadError => "upload-error",
            Self::UploadSuccess => "upload-success",
        }
    }

    /// Parse from the host string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file-removed" => Some(Self::FileRemoved),
            "upload-pause" => Some(Self::UploadPause),
            "pause-all" => Some(Self::PauseAll),
            "cancel-all" => Some(Self::CancelAll),
            "resume-all" => Some(Self::ResumeAll),
            "upload-retry" => Some(Self::UploadRetry),
            "retry-all" => Some(Self::RetryAll),
            "back-online" => Some(Self::BackOnline),
            "reset-progress" => Some(Self::ResetProgress),
            "upload-started" => Some(Self::UploadStarted),
            "upload-progress" => Some(Self::UploadProgress),
            "upload-error" => Some(Self::UploadError),
            "upload-success" => Some(Self::UploadSuccess),
            _ => None,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event on the signal bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    FileRemoved {
        file_id: FileId,
    },
    UploadPause {
        file_id: FileId,
        is_paused: bool,
    },
    PauseAll,
    CancelAll,
    ResumeAll,
    UploadRetry {
        file_id: FileId,
    },
    RetryAll,
    BackOnline,
    ResetProgress,
    UploadStarted {
        file_id: FileId,
    },
    UploadProgress {
        file_id: FileId,
        bytes_uploaded: u64,
        bytes_total: u64,
    },
    UploadError {
        file_id: FileId,
        error: String,
    },
    UploadSuccess {
        file_id: FileId,
        upload_url: Option<String>,
    },
}

impl BusEvent {
    /// Name this event is delivered under
    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            Self::FileRemoved { .. } => EventName::FileRemoved,
            Self::UploadPause { .. } => EventName::UploadPause,
            Self::PauseAll => EventName::PauseAll,
            Self::CancelAll => EventName::CancelAll,
            Self::ResumeAll => EventName::ResumeAll,
            Self::UploadRetry { .. } => EventName::UploadRetry,
            Self::RetryAll => EventName::RetryAll,
            Self::BackOnline => EventName::BackOnline,
            Self::ResetProgress => EventName::ResetProgress,
            Self::UploadStarted { .. } => EventName::UploadStarted,
            Self::UploadProgress { .. } => EventName::UploadProgress,
            Self::UploadError { .. } => EventName::UploadError,
            Self::UploadSuccess { .. } => EventName::UploadSuccess,
        }
    }

    /// File this event targets, if it is file-specific
    #[must_use]
    pub fn file_id(&self) -> Option<&FileId> {
        match self {
            Self::FileRemoved { file_id }
            | Self::UploadPause { file_id, .. }
            | Self::UploadRetry { file_id }
            | Self::UploadStarted { file_id }
            | Self::UploadProgress { file_id, .. }
            | Self::UploadError { file_id, .. }
            | Self::UploadSuccess { file_id, .. } => Some(file_id),
            Self::PauseAll
            | Self::CancelAll
            | Self::ResumeAll
            | Self::RetryAll
            | Self::BackOnline
            | Self::ResetProgress => None,
        }
    }
}
