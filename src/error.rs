// ⚠️ Error taxonomy for the sync core
//
// Only conditions that mean "operation did not apply" are errors here.
// Identity collisions, dangling references and import duplicates are normal
// states and are reported as counts (see ChangeSet, ImportReport).

use crate::entities::EntityKind;
use thiserror::Error;

/// Result alias used across the library.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Store unreadable for a query. Callers may fall back to a cached snapshot.
    #[error("query failed for {kind}: {source}")]
    QueryFailure {
        kind: EntityKind,
        #[source]
        source: rusqlite::Error,
    },

    /// Write conflict or I/O error while committing; the unit of work rolled back.
    #[error("commit of '{operation}' failed: {source}")]
    CommitFailure {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Low-level store error outside a query/commit classification (schema setup, open).
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Spawning a context thread or reading a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A CSV row could not be turned into a candidate record.
    #[error("invalid record at line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// The execution context's queue has shut down.
    #[error("execution context '{0}' is closed")]
    ContextClosed(String),

    /// Work was aborted by the caller or rejected before touching the store.
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        SyncError::Aborted {
            reason: reason.into(),
        }
    }

    pub fn query(kind: EntityKind) -> impl FnOnce(rusqlite::Error) -> SyncError {
        move |source| SyncError::QueryFailure { kind, source }
    }

    /// True for errors a caller can recover from by reading a secondary source.
    pub fn is_query_failure(&self) -> bool {
        matches!(self, SyncError::QueryFailure { .. })
    }

    pub fn is_commit_failure(&self) -> bool {
        matches!(self, SyncError::CommitFailure { .. })
    }
}
