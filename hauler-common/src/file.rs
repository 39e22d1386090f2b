//! File model shared between the host and the upload core
//!
//! An `UploadFile` is owned by the host's [`FileRegistry`](crate::registry::FileRegistry).
//! The upload core only ever works on snapshots and writes back through the
//! registry, so a file removed by the host simply stops being visible.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// File Identity
// =============================================================================

/// Stable identifier of a file in the registry
///
/// Hosts usually derive this from the file's origin (including any relative
/// folder path), so two files with identical bytes still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Create a file id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random file id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// The bytes to upload, or a reference to where they live
#[derive(Debug, Clone)]
pub enum Payload {
    /// In-memory contents
    Bytes(Arc<[u8]>),
    /// Contents stored on the local filesystem
    Path(PathBuf),
    /// No local contents (relayed files are fetched by the remote worker)
    Remote,
}

impl Payload {
    /// Wrap in-memory bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::from(bytes.into()))
    }
}

// =============================================================================
// Remote Source
// =============================================================================

/// Where a remotely-originated file comes from and how to reach its worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSource {
    /// Base URL of the worker host (http/https)
    pub companion_url: String,
    /// URL the negotiation request is sent to
    pub url: String,
    /// Extra body fields forwarded with the negotiation request
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,
    /// Provider name when the file comes from an authenticated provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

// =============================================================================
// Per-file Overrides
// =============================================================================

/// Per-file upload settings that take precedence over the caller's options
///
/// `upload_url` doubles as the resumption record: it holds the last
/// resumable-session URL the protocol confirmed for this file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delays: Option<Vec<u64>>,
}

// =============================================================================
// Progress
// =============================================================================

/// Transfer progress as last reported for a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
}

// =============================================================================
// Upload File
// =============================================================================

/// A file queued for upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub id: FileId,
    pub data: Payload,
    /// Expected size of the payload in bytes
    pub size: u64,
    /// Metadata forwarded to the server (e.g. `name`, `type`)
    pub meta: BTreeMap<String, String>,
    /// Whether the bytes are fetched and uploaded by a remote worker
    pub is_remote: bool,
    pub remote: Option<RemoteSource>,
    /// Error marker set by the host (validation) or by a failed attempt
    pub error: Option<String>,
    /// Token of the remote worker handling this file, once negotiated
    pub server_token: Option<String>,
    pub overrides: Option<UploadOverrides>,
    pub is_paused: bool,
    pub progress: FileProgress,
}

impl UploadFile {
    /// Create a local file backed by in-memory bytes
    pub fn local(id: impl Into<FileId>, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        let mut meta = BTreeMap::new();
        meta.insert("name".to_string(), name.to_string());
        Self {
            id: id.into(),
            data: Payload::from_bytes(bytes),
            size,
            meta,
            is_remote: false,
            remote: None,
            error: None,
            server_token: None,
            overrides: None,
            is_paused: false,
            progress: FileProgress::default(),
        }
    }

    /// Create a file whose upload is performed by a remote worker
    pub fn remote(id: impl Into<FileId>, name: &str, size: u64, source: RemoteSource) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("name".to_string(), name.to_string());
        Self {
            id: id.into(),
            data: Payload::Remote,
            size,
            meta,
            is_remote: true,
            remote: Some(source),
            error: None,
            server_token: None,
            overrides: None,
            is_paused: false,
            progress: FileProgress::default(),
        }
    }

    /// Set a metadata field, returning self for chaining
    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    /// Display name from metadata, falling back to the id
    pub fn name(&self) -> &str {
        self.meta
            .get("name")
            .map(String::as_str)
            .unwrap_or_else(|| self.id.as_str())
    }

    /// Resumption URL recorded for this file, if any
    pub fn upload_url(&self) -> Option<&str> {
        self.overrides.as_ref()?.upload_url.as_deref()
    }
}
