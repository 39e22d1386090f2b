//! Constants shared across the upload core

/// Default delays (ms) between automatic retries of a direct transfer
pub const DEFAULT_RETRY_DELAYS: [u64; 4] = [0, 1000, 3000, 5000];

/// Application directory name under the platform data directory
pub const APP_DIR_NAME: &str = "hauler";

/// Checkpoint file name
pub const CHECKPOINT_FILE_NAME: &str = "resumption.json";

/// Advisory logged when uploads run without a concurrency limit
pub const UNBOUNDED_LIMIT_WARNING: &str = "When uploading multiple files at once, consider setting the `limit` option (to `10` for example), to limit the number of concurrent uploads, which helps prevent memory and network issues";
