//! Defaults and well-known field names.

use std::time::Duration;

/// Logz.io listener used when `LOGZIO_ENDPOINT_URL` is not set.
pub const DEFAULT_ENDPOINT_URL: &str = "https://listener.logz.io:8071";

/// Value of the `type` query parameter when `LOGZIO_TYPE` is not set.
pub const DEFAULT_LOG_TYPE: &str = "eventHub";

pub const DEFAULT_THREAD_COUNT: usize = 4;
pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_INTERVAL_TIME_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FOLDER_MAX_SIZE_MB: u64 = 10_000;
pub const DEFAULT_FILE_MAX_RECORDS: usize = 100;

/// How long an idle worker waits on the delivery queue before re-checking
/// for cancellation.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Envelope key wrapping nested events (Azure diagnostic settings format).
pub const RECORDS_KEY: &str = "records";

pub const TIME_KEY: &str = "time";
pub const TIMESTAMP_KEY: &str = "@timestamp";

/// Name of the sub-directory of the backup root holding staged folders.
pub const BACKUP_ROOT_NAME: &str = "logzio-backup";

/// Name of the sub-directory used by the local upload sink.
pub const LOCAL_UPLOAD_DIR_NAME: &str = "logzio-uploads";

pub(crate) const BYTES_PER_MB: u64 = 1_024 * 1_024;
