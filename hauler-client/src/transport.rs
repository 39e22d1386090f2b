//! Collaborator interfaces
//!
//! The upload core drives three external collaborators:
//!
//! - `ResumableTransport` - the resumable-upload protocol client. Each
//!   attempt is a `TransferHandle` (start/abort) plus a stream of
//!   `TransferEvent`s, with at most one terminal event per attempt.
//! - `WorkerNegotiator` - asks a remote worker host to take over a file and
//!   returns the worker's session token.
//! - `RelayConnector` - opens the persistent channel to that worker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use hauler_common::Payload;

use crate::config::TransferConfig;

// =============================================================================
// Direct Transfers
// =============================================================================

/// Event reported by a resumable transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { bytes_uploaded: u64, bytes_total: u64 },
    /// Terminal: the upload finished
    Success,
    /// Terminal: the upload failed after the collaborator's own retries
    Error { message: String },
}

/// One resumable upload attempt
pub trait TransferHandle: Send {
    /// Start, or restart after `abort`, from the last confirmed offset
    fn start(&mut self);

    /// Stop any in-flight request; the handle can be started again
    fn abort(&mut self);

    /// Resumable-session URL, once the server has assigned one
    fn url(&self) -> Option<String>;
}

/// Factory for resumable upload attempts
pub trait ResumableTransport: Send + Sync {
    fn create(
        &self,
        payload: Payload,
        config: TransferConfig,
    ) -> (
        Box<dyn TransferHandle>,
        mpsc::UnboundedReceiver<TransferEvent>,
    );
}

// =============================================================================
// Remote Worker Negotiation
// =============================================================================

/// Request asking a worker host to upload a file on our behalf
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationRequest {
    /// Where to send the request
    pub url: String,
    /// Provider handling the file, if any (selects an authenticated client)
    pub provider: Option<String>,
    /// Caller-supplied body fields
    pub body: serde_json::Map<String, serde_json::Value>,
    pub endpoint: String,
    pub upload_url: Option<String>,
    pub protocol: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
}

impl NegotiationRequest {
    /// JSON body: the caller's fields with the upload target merged on top
    pub fn payload(&self) -> serde_json::Value {
        let mut body = self.body.clone();
        body.insert("endpoint".into(), self.endpoint.clone().into());
        body.insert(
            "uploadUrl".into(),
            self.upload_url
                .clone()
                .map_or(serde_json::Value::Null, Into::into),
        );
        body.insert("protocol".into(), self.protocol.clone().into());
        body.insert("size".into(), self.size.into());
        body.insert(
            "metadata".into(),
            serde_json::to_value(&self.metadata).unwrap_or_default(),
        );
        serde_json::Value::Object(body)
    }
}

/// Worker host reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub token: String,
}

#[async_trait]
pub trait WorkerNegotiator: Send + Sync {
    /// Acquire a worker; errors carry the underlying cause
    async fn negotiate(&self, request: NegotiationRequest) -> Result<NegotiationResponse, String>;
}

// =============================================================================
// Relay Channel
// =============================================================================

/// Command sent to a remote worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    Pause,
    Resume,
}

impl ChannelCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

/// Progress report from a worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// Formatted percentage; empty or missing means nothing to report
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub bytes_uploaded: u64,
    #[serde(default)]
    pub bytes_total: u64,
}

/// Error object reported by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    /// Any additional fields the worker sent
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: RemoteError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessPayload {
    #[serde(default)]
    pub url: Option<String>,
}

/// Message received from a worker channel
///
/// Wire form: `{"action": "progress", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "lowercase")]
pub enum ChannelEvent {
    Progress(ProgressPayload),
    Error(ErrorPayload),
    Success(SuccessPayload),
}

/// Open channel to a remote worker
pub trait RelayChannel: Send {
    fn send(&mut self, command: ChannelCommand);

    /// Close the channel; the worker treats this as abandonment
    fn close(&mut self);
}

pub trait RelayConnector: Send + Sync {
    /// Open a channel to `target` (e.g. `wss://host/api/<token>`)
    fn open(
        &self,
        target: &str,
    ) -> Result<
        (
            Box<dyn RelayChannel>,
            mpsc::UnboundedReceiver<ChannelEvent>,
        ),
        String,
    >;
}

/// Channel base address for a worker host URL
///
/// `http://` maps to `ws://`, anything else to `wss://`. Credentials and a
/// leading `www.` are dropped.
pub fn socket_host(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    let protocol = if lower.starts_with("http://") {
        "ws"
    } else {
        "wss"
    };

    let mut host = url;
    for prefix in ["http://", "https://", "//"] {
        if lower.starts_with(prefix) {
            host = &url[prefix.len()..];
            break;
        }
    }
    if let Some(at) = host.rfind('@') {
        host = &host[at + 1..];
    }
    if host.len() >= 4 && host[..4].eq_ignore_ascii_case("www.") {
        host = &host[4..];
    }

    format!("{protocol}://{host}")
}
