//! Crate-level error type.
//!
//! Failures fall into four groups:
//!
//! | Kind | Variants | Handling |
//! |------|----------|----------|
//! | Transport | `Storage`, `Lab`, `Cache`, `Tracker` (and `Io`) | Propagated to the caller, never retried |
//! | Invariant violation | `InvariantViolation` | Fatal; the remote sent a corrupt response |
//! | Partial download failure | *(not an error)* | Recorded per run in [`DownloadReport`](crate::orchestrator::DownloadReport) |
//! | Stale entry access | `Archive(ArchiveError::StaleEntry)` | Usage error, reported immediately |
//!
//! `Cancelled` is returned when a poll is stopped through its cancellation
//! token.

use crate::archive::ArchiveError;
use crate::cache::CacheError;
use crate::lab::LabError;
use crate::storage::StorageError;
use crate::tracker::TrackerError;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lab(#[from] LabError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote service returned something that breaks a basic invariant,
    /// e.g. a submitted run without an id.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Polling was cancelled before every run finished.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` for network or backend failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Lab(_)
                | Error::Cache(_)
                | Error::Tracker(_)
                | Error::Io(_)
        )
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }
}
