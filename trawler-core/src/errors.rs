//! Error kinds propagated by the data plane.
//!
//! Backend errors carry explicit kinds so retry loops can discriminate
//! transient failures without matching on message strings.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Checkout timed out, endpoint finished, or an exclusive lock is held.
    #[error("shard is not available: {0}")]
    NotAvailable(String),

    /// Document or metadata key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied version does not match the stored version.
    #[error("version mismatch: {0}")]
    VersionConflict(String),

    /// Blob-storage header, footer or checksum verification failed.
    #[error("corrupt storage volume: {0}")]
    CorruptVolume(String),

    /// Writable blob volume is full; callers roll to the next volume.
    #[error("storage volume is full")]
    StorageEof,

    /// The blob record at the given locator has been tombstoned.
    #[error("stored blob not found")]
    StorageNotFound,

    /// Backend index could not be opened.
    #[error("error opening database: {0}")]
    Opening(String),

    /// Remote endpoint unreachable or misconfigured.
    #[error("network error: {0}")]
    Network(String),

    /// Backend handle was closed underneath the caller.
    #[error("database has been closed")]
    DatabaseClosed,

    /// Backend changed on disk while a reader held an older snapshot.
    #[error("database has been modified")]
    DatabaseModified,

    /// A value does not match its declared field type.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Syntactic problem with a query object.
    #[error("query dsl error: {0}")]
    QueryDsl(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Transient kinds are retried internally (close-and-reopen) up to the
    /// configured retry count before being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Opening(_) | Error::Network(_) | Error::DatabaseClosed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
