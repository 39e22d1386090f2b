//! Hauler Client Library
//!
//! Resumable upload orchestration. Files are uploaded either directly
//! through a resumable-transfer collaborator or by a remote worker reached
//! over a persistent channel, under a shared concurrency limit and driven
//! by lifecycle signals on the host's event bus.

pub mod config;
mod constants;
pub mod error;
pub mod gate;
pub mod resumption;
pub mod scope;
mod sessions;
pub mod transport;
mod uploader;

pub use config::{TransferConfig, UploaderOptions, build_metadata, fingerprint};
pub use constants::DEFAULT_RETRY_DELAYS;
pub use error::{FileResult, StoreError, UploadError, UploadOutcome};
pub use gate::ConcurrencyGate;
pub use resumption::{ResumptionRecord, ResumptionStore};
pub use scope::ListenerScope;
pub use sessions::{SessionKind, SessionState};
pub use transport::{
    ChannelCommand, ChannelEvent, ErrorPayload, NegotiationRequest, NegotiationResponse,
    ProgressPayload, RelayChannel, RelayConnector, RemoteError, ResumableTransport,
    SuccessPayload, TransferEvent, TransferHandle, WorkerNegotiator, socket_host,
};
pub use uploader::{Collaborators, Uploader};
