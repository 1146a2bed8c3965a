//! Access to the remote archive-source server
//!
//! This crate provides:
//! - The `SourceClient` interface the pipeline consumes
//! - An Orthanc REST implementation over `reqwest`
//! - An in-memory implementation with fault injection

pub mod memory;
pub mod orthanc;

use async_trait::async_trait;
use retire_core::{SeriesMetadata, StudyMetadata};
use thiserror::Error;
use tokio::io::AsyncWrite;

// Re-exports
pub use memory::MemorySource;
pub use orthanc::OrthancClient;

/// Errors surfaced by source calls, distinguishable by kind
#[derive(Debug, Error)]
pub enum SourceError {
    /// The resource does not exist on the server.
    #[error("Not found on source: {0}")]
    NotFound(String),

    /// The call did not complete within its time limit.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server answered with a non-success status.
    #[error("Server returned {status} for {resource}")]
    Server { status: u16, resource: String },

    /// Connection, TLS or protocol failure.
    #[error("Transport error for {resource}: {message}")]
    Transport { resource: String, message: String },

    /// The server answered with a body we could not interpret.
    #[error("Malformed response for {resource}: {message}")]
    Decode { resource: String, message: String },

    /// Writing fetched bytes to the local sink failed.
    #[error("Failed to write fetched bytes: {0}")]
    Sink(#[source] std::io::Error),

    /// The client could not be constructed.
    #[error("Invalid source configuration: {0}")]
    Config(String),
}

impl SourceError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout(_) | SourceError::Server { .. } | SourceError::Transport { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

/// Byte sink instance payloads are streamed into
pub type InstanceSink = dyn AsyncWrite + Unpin + Send;

/// Operations the pipeline needs from the source server
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Identifiers of every series held by the server
    async fn list_series(&self) -> Result<Vec<String>, SourceError>;

    /// Last update, parent study and instance list of a series
    async fn get_series_metadata(&self, series_id: &str) -> Result<SeriesMetadata, SourceError>;

    /// Parent patient of a study
    async fn get_study_metadata(&self, study_id: &str) -> Result<StudyMetadata, SourceError>;

    /// Stream the raw bytes of one instance into `sink`
    ///
    /// Returns the number of bytes written. Implementations must not buffer
    /// the whole payload.
    async fn fetch_instance(&self, instance_id: &str, sink: &mut InstanceSink) -> Result<u64, SourceError>;

    /// Remove a series from the server
    async fn delete_series(&self, series_id: &str) -> Result<(), SourceError>;
}
