//! Error types for the imgstash library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, CacheError>`. The variants map one-to-one onto the failure
//! kinds the cache distinguishes: daemon transport problems, expected
//! absences (`NotFound` is a value, not a fault), corrupt metadata, and
//! plain I/O failures wrapping their cause.

use std::time::Duration;

/// Result type alias for operations that may return a [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The daemon did not answer its liveness probe before the deadline.
    #[error("daemon is not ready after {0:?}")]
    DaemonNotReady(Duration),

    /// The daemon answered but the call failed.
    #[error("daemon call failed: {0}")]
    DaemonCallFailed(String),

    /// The daemon could not be reached at all.
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(#[source] reqwest::Error),

    /// An image expected in the daemon is no longer there.
    #[error("image '{0}' has not been found in the daemon")]
    ImageGoneFromDaemon(String),

    /// A requested image is absent from the on-disk store.
    #[error("image '{0}' does not exist")]
    ImageMissing(String),

    /// The metadata index file exists but is not valid JSON.
    #[error("metadata file is corrupt: {0}")]
    MetadataCorrupt(#[source] serde_json::Error),

    /// I/O error during a filesystem or stream operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata key is absent. This is an expected outcome, not a fault.
    #[error("not found")]
    NotFound,

    /// A readiness wait was cancelled before it completed.
    #[error("cancelled while waiting")]
    Cancelled,

    /// The storage directory did not become usable before the deadline.
    #[error("storage is not ready after {0:?}")]
    StorageNotReady(Duration),

    /// The recency index was configured with an unusable capacity.
    #[error("invalid cache capacity {0}, at least one image is required")]
    InvalidCapacity(usize),

    /// The daemon endpoint configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            CacheError::DaemonUnavailable(err)
        } else {
            CacheError::DaemonCallFailed(err.to_string())
        }
    }
}

impl CacheError {
    /// Wrap a blocking-task join failure as an I/O error.
    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}
