//! Upload outcomes and errors
//!
//! Every failure is scoped to one file. Removal and cancellation are not
//! errors: they settle successfully with a termination outcome.

use std::fmt;

use thiserror::Error;

use hauler_common::FileId;

/// How a file's upload settled without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The upload finished; carries the final retrieval location if known
    Completed { upload_url: Option<String> },
    /// The file was removed while uploading
    Removed,
    /// The upload was canceled (cancel-all, or replaced by a newer attempt)
    Canceled,
}

impl UploadOutcome {
    /// Whether this outcome is a finished upload
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Human-readable description for a given file
    pub fn describe(&self, file_id: &FileId) -> String {
        match self {
            Self::Completed { .. } => format!("upload {file_id} completed"),
            Self::Removed => format!("upload {file_id} was removed"),
            Self::Canceled => format!("upload {file_id} was canceled"),
        }
    }
}

/// File-scoped upload failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    /// The file carried an error marker before it was scheduled
    #[error("{0}")]
    FileError(String),

    /// A remote worker could not be acquired
    #[error("{0}")]
    Negotiation(String),

    /// The relay channel could not be opened or closed unexpectedly
    #[error("relay channel failed: {0}")]
    Channel(String),

    /// Protocol-level failure from either upload path
    #[error("Failed because: {message}")]
    Transfer {
        message: String,
        /// Original error payload reported by a remote worker
        cause: Option<serde_json::Value>,
    },
}

impl UploadError {
    /// Transfer failure without a structured cause
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
            cause: None,
        }
    }
}

/// Settled result for one file in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct FileResult {
    pub file_id: FileId,
    pub result: Result<UploadOutcome, UploadError>,
}

impl FileResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl fmt::Display for FileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(outcome) => f.write_str(&outcome.describe(&self.file_id)),
            Err(e) => write!(f, "upload {} failed: {e}", self.file_id),
        }
    }
}

/// Error type for checkpoint persistence
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no data directory available for the checkpoint file")]
    NoDataDir,

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
