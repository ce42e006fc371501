//! Error types for the lodestone engine.
//!
//! `DbError` is the single error enum crossing the core boundary; the
//! variants map onto the failure classes the engine distinguishes
//! (fatal-at-bootstrap opens, degraded-but-running WAL writes, rejected
//! requests).

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// The scalar KV engine refused to open the database file. Fatal at
    /// bootstrap.
    #[error("failed to open scalar store at {path:?}: {reason}")]
    StoreOpen { path: PathBuf, reason: String },

    /// The WAL file could not be opened read+write+append. Fatal at
    /// bootstrap.
    #[error("failed to open WAL at {path:?}: {source}")]
    WalOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A WAL append or flush failed. The entry is non-durable; in-memory
    /// state is not rolled back.
    #[error("WAL write failed: {0}")]
    WalWrite(std::io::Error),

    /// Snapshot directory creation failed. The snapshot is aborted and the
    /// watermark is not advanced.
    #[error("failed to create snapshot directory {path:?}: {source}")]
    SnapshotDirCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An operation was dispatched to an index kind with no initialized
    /// instance in the registry.
    #[error("no initialized index for kind {0}")]
    IndexAbsent(&'static str),

    /// A request named an index kind string with no registered handler.
    #[error("unknown index type {0:?}")]
    UnknownIndexType(String),

    /// A vector's length does not match the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The graph index is at its live-point capacity.
    #[error("graph index is full: max_elements={max}")]
    CapacityExceeded { max: usize },

    /// A request document is missing a required member or has the wrong
    /// shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Error from the embedded KV engine.
    #[error("storage engine error: {0}")]
    Storage(String),

    /// A persisted index or filter payload failed to decode.
    #[error("corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

macro_rules! impl_from_redb {
    ($($ty:ty),+ $(,)?) => {
        $(impl From<$ty> for DbError {
            fn from(e: $ty) -> Self {
                DbError::Storage(e.to_string())
            }
        })+
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
