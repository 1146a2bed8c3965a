//! Error types shared across the workspace

use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be loaded or failed validation.
///
/// Always fatal: raised before any network or disk activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML/JSON for the schema.
    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A value parsed but is outside its accepted range.
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors raised while writing or reading a series container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("I/O error on container {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The series id cannot be used as a single file name.
    #[error("Series id is not a valid path component: {0:?}")]
    InvalidSeriesId(String),

    /// The instance id cannot be used as a tar entry name.
    #[error("Instance id is not a valid entry name: {0:?}")]
    InvalidInstanceId(String),

    /// A spooled payload did not have the size the writer was told.
    #[error("Entry {entry} truncated: expected {expected} bytes, wrote {actual}")]
    Truncated {
        entry: String,
        expected: u64,
        actual: u64,
    },

    /// The container on disk does not hold the expected instance set.
    #[error("Container {path} does not match the series: {reason}")]
    Mismatch { path: PathBuf, reason: String },
}

impl ContainerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
