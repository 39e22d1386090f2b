//! Uploader options and per-session transfer configuration
//!
//! Precedence, lowest to highest:
//! 1. Built-in defaults (`UploaderOptions::default()`)
//! 2. Caller options (`UploaderOptions` as supplied to the uploader)
//! 3. Per-file overrides (`UploadFile::overrides`, which also carry the
//!    recorded resumption URL)
//!
//! The merge happens once per session in [`TransferConfig::resolve`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use hauler_common::UploadFile;

use crate::constants::DEFAULT_RETRY_DELAYS;

// =============================================================================
// Uploader Options
// =============================================================================

/// Options recognized by the uploader
///
/// Deserializes from camelCase keys; any key left out keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploaderOptions {
    /// Upload creation endpoint for direct uploads
    pub endpoint: String,
    /// Whether the transfer collaborator may resume a previous session
    pub resume: bool,
    /// Retry all uploads when connectivity comes back
    pub auto_retry: bool,
    /// Keep the remote worker token when a relayed upload fails
    pub use_fast_remote_retry: bool,
    /// Maximum concurrent uploads (0 = unbounded)
    pub limit: usize,
    /// Delays in milliseconds between automatic retries of a direct transfer
    pub retry_delays: Vec<u64>,
    /// Metadata fields sent to the server (all fields when unset)
    pub meta_fields: Option<Vec<String>>,
    /// Extra request headers for direct transfers
    pub headers: HashMap<String, String>,
    /// Chunk size in bytes (unset = single request)
    pub chunk_size: Option<u64>,
    pub with_credentials: bool,
    pub override_patch_method: bool,
    /// Existing upload URL to resume against
    pub upload_url: Option<String>,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            resume: true,
            auto_retry: true,
            use_fast_remote_retry: true,
            limit: 0,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            meta_fields: None,
            headers: HashMap::new(),
            chunk_size: None,
            with_credentials: false,
            override_patch_method: false,
            upload_url: None,
        }
    }
}

impl UploaderOptions {
    /// Options targeting `endpoint`, everything else default
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Transfer Config
// =============================================================================

/// Fully resolved configuration handed to the transfer collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    pub endpoint: String,
    pub upload_url: Option<String>,
    pub resume: bool,
    pub chunk_size: Option<u64>,
    pub headers: HashMap<String, String>,
    pub with_credentials: bool,
    pub override_patch_method: bool,
    pub retry_delays: Vec<u64>,
    pub upload_size: u64,
    /// Identity used to look up a resumable session; always derived from
    /// the file id, never from content
    pub fingerprint: String,
    pub metadata: BTreeMap<String, String>,
}

impl TransferConfig {
    /// Merge caller options with the file's own overrides
    pub fn resolve(options: &UploaderOptions, file: &UploadFile) -> Self {
        let overrides = file.overrides.clone().unwrap_or_default();

        let endpoint = overrides
            .endpoint
            .unwrap_or_else(|| options.endpoint.clone());
        let meta_fields = overrides.meta_fields.or_else(|| options.meta_fields.clone());

        Self {
            fingerprint: fingerprint(file, &endpoint),
            metadata: build_metadata(&file.meta, meta_fields.as_deref()),
            endpoint,
            upload_url: overrides.upload_url.or_else(|| options.upload_url.clone()),
            resume: overrides.resume.unwrap_or(options.resume),
            chunk_size: overrides.chunk_size.or(options.chunk_size),
            headers: overrides.headers.unwrap_or_else(|| options.headers.clone()),
            with_credentials: options.with_credentials,
            override_patch_method: options.override_patch_method,
            retry_delays: overrides
                .retry_delays
                .unwrap_or_else(|| options.retry_delays.clone()),
            upload_size: file.size,
        }
    }
}

/// Resumable-session fingerprint for a file
///
/// Two files with the same bytes from different folders have different ids,
/// so they never share a session.
pub fn fingerprint(file: &UploadFile, endpoint: &str) -> String {
    format!("tus-{}-{}", file.id, endpoint)
}

/// Build the metadata sent with a direct upload
///
/// Takes the allow-listed fields (or every field), then copies `type` to
/// `filetype` and `name` to `filename` unless the destination is already
/// present. Allow-listed fields the file doesn't have are skipped.
pub fn build_metadata(
    meta: &BTreeMap<String, String>,
    meta_fields: Option<&[String]>,
) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = match meta_fields {
        Some(fields) => fields
            .iter()
            .filter_map(|field| meta.get(field).map(|v| (field.clone(), v.clone())))
            .collect(),
        None => meta.clone(),
    };

    copy_field(&mut out, "type", "filetype");
    copy_field(&mut out, "name", "filename");
    out
}

fn copy_field(meta: &mut BTreeMap<String, String>, src: &str, dest: &str) {
    if meta.contains_key(dest) {
        return;
    }
    if let Some(value) = meta.get(src).cloned() {
        meta.insert(dest.to_string(), value);
    }
}
