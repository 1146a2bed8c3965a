//! Archive-and-commit pipeline
//!
//! This crate provides:
//! - `ArchiveBuilder`: concurrent fetch into a single tar.gz writer
//! - `RetentionPipeline`: scan, retention check, begin/build/commit/delete
//! - Crash recovery of PENDING records left by interrupted runs
//! - Cooperative cancellation and per-run summaries

pub mod builder;
pub mod cancel;
pub mod pipeline;
pub mod summary;

use retire_core::ContainerError;
use retire_index::IndexError;
use retire_source::SourceError;
use thiserror::Error;

// Re-exports
pub use builder::{ArchiveBuilder, BuildError, BuiltContainer};
pub use cancel::Cancellation;
pub use pipeline::{PipelineOptions, RetentionPipeline};
pub use summary::RunSummary;

/// Failures that halt a run
///
/// Everything else is contained to the series it happened on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Recovery of pending records failed: {0}")]
    Recovery(#[source] IndexError),

    #[error("Archive root is unusable: {0}")]
    Layout(#[from] ContainerError),

    #[error("Failed to list series on source: {0}")]
    Scan(#[source] SourceError),

    #[error("Failed to record start of series {series_id}: {source}")]
    IndexBegin {
        series_id: String,
        #[source]
        source: IndexError,
    },

    /// The container exists but the index could not record it. The series
    /// is left on the source and recovered by the next run.
    #[error("Failed to commit series {series_id}: {source}")]
    IndexCommit {
        series_id: String,
        #[source]
        source: IndexError,
    },

    /// A record this run created disappeared before commit.
    #[error("Pending record for series {0} vanished before commit")]
    RecordNotFound(String),
}
