//! Durable archive index
//!
//! This crate provides:
//! - The `ArchiveIndex` interface (begin / commit / abort / find_pending / list_committed)
//! - A sled backend (default, embedded)
//! - A SQLite backend (single file, `archived_series` table)
//!
//! Every mutation is one local transaction and is flushed before it
//! returns. Only one pipeline process may own an index at a time; the CLI
//! enforces that with a run lock on the archive root.

pub mod sled_index;
pub mod sqlite_index;

use chrono::{DateTime, Utc};
use retire_core::{ArchiveRecord, CommitInfo, DatabaseBackend, RecordFilter};
use std::path::Path;
use thiserror::Error;

// Re-exports
pub use sled_index::SledIndex;
pub use sqlite_index::SqliteIndex;

/// Lazy sequence of committed records
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<ArchiveRecord, IndexError>> + 'a>;

/// Errors raised by index backends
#[derive(Debug, Error)]
pub enum IndexError {
    /// A record (pending or committed) already exists for the series.
    /// Callers treat this as "already handled", not as a failure.
    #[error("Series {0} is already tracked by the index")]
    DuplicateSeries(String),

    /// No PENDING record exists where one must.
    #[error("No pending record for series {0}")]
    RecordNotFound(String),

    /// Attempt to abort a record that is already committed.
    #[error("Series {0} is committed and cannot be aborted")]
    AlreadyCommitted(String),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt index entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Transactional record of archived series
pub trait ArchiveIndex: Send + Sync {
    /// Insert a PENDING record stamped with the current time
    ///
    /// Fails with `DuplicateSeries` if any record exists for `series_id`.
    fn begin(&self, series_id: &str, study_id: &str, patient_id: &str) -> Result<ArchiveRecord, IndexError> {
        self.begin_at(series_id, study_id, patient_id, Utc::now())
    }

    /// Insert a PENDING record stamped with `begun_at`
    fn begin_at(
        &self,
        series_id: &str,
        study_id: &str,
        patient_id: &str,
        begun_at: DateTime<Utc>,
    ) -> Result<ArchiveRecord, IndexError>;

    /// Flip a PENDING record to COMMITTED, storing the container facts
    ///
    /// Fails with `RecordNotFound` if there is no PENDING record.
    fn commit(&self, series_id: &str, info: CommitInfo) -> Result<ArchiveRecord, IndexError>;

    /// Remove a PENDING record
    ///
    /// Returns `false` when no record exists. Committed records are never
    /// removed (`AlreadyCommitted`).
    fn abort(&self, series_id: &str) -> Result<bool, IndexError>;

    /// All PENDING records, left behind by interrupted runs
    fn find_pending(&self) -> Result<Vec<ArchiveRecord>, IndexError>;

    /// Committed records matching `filter`, ordered by series id
    fn list_committed(&self, filter: RecordFilter) -> RecordIter<'_>;

    /// Look up one record in any state
    fn get(&self, series_id: &str) -> Result<Option<ArchiveRecord>, IndexError>;
}

/// Open the configured index backend at `path`
pub fn open_index(backend: DatabaseBackend, path: &Path) -> Result<Box<dyn ArchiveIndex>, IndexError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let index: Box<dyn ArchiveIndex> = match backend {
        DatabaseBackend::Sled => Box::new(SledIndex::open(path)?),
        DatabaseBackend::Sqlite => Box::new(SqliteIndex::open(path)?),
    };

    tracing::debug!(backend = ?backend, path = %path.display(), "Opened archive index");
    Ok(index)
}
