//! Hauler Common Library
//!
//! Shared file model, named bus events, the signal bus and the host file
//! registry used by the Hauler upload core.

pub mod bus;
pub mod events;
pub mod file;
pub mod registry;

pub use bus::{EventBus, Handler, SubscriptionId};
pub use events::{BusEvent, EventName};
pub use file::{FileId, FileProgress, Payload, RemoteSource, UploadFile, UploadOverrides};
pub use registry::FileRegistry;

/// Protocol identifier sent to remote workers
pub const UPLOAD_PROTOCOL: &str = "tus";
