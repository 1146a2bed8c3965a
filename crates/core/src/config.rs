//! Run configuration
//!
//! Loaded from TOML (or JSON when the file ends in `.json`). Key names of
//! the legacy JSON layout (`OrthancURL`, `PersistenceTimespan`,
//! `ArchivePath`, `DatabaseBackend`, `SQLite.FilePath`) are accepted as
//! aliases so existing deployments keep working.

use crate::error::ConfigError;
use crate::layout::is_date_bucket;
use crate::policy::RetentionPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Index storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// Embedded sled tree
    #[default]
    #[serde(alias = "Sled")]
    Sled,
    /// Single-file SQLite database
    #[serde(alias = "SQLite", alias = "Sqlite")]
    Sqlite,
}

impl DatabaseBackend {
    /// Default index file name inside the archive root
    pub fn default_file_name(&self) -> &'static str {
        match self {
            DatabaseBackend::Sled => "index.sled",
            DatabaseBackend::Sqlite => "index.sqlite3",
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Source server address, with or without scheme (`127.0.0.1:8042`)
    #[serde(alias = "OrthancURL")]
    pub server_address: String,

    /// Days a series stays on the source after its last update
    #[serde(alias = "PersistenceTimespan")]
    pub retention_window_days: u32,

    /// Root of the dated archive tree, absolute
    #[serde(alias = "ArchivePath")]
    pub archive_root_path: PathBuf,

    #[serde(default, alias = "DatabaseBackend")]
    pub database_backend: DatabaseBackend,

    /// Backend specific settings (`path` / `FilePath`)
    #[serde(default, alias = "SQLite", alias = "Sled")]
    pub backend_settings: BTreeMap<String, String>,

    #[serde(default)]
    pub source: SourceSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Source server connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Upper bound on any single request, including body transfer
    pub request_timeout_secs: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            request_timeout_secs: 30,
        }
    }
}

/// Archive pipeline tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Attempts per series build before giving up (default: 3)
    pub build_attempts: u32,
    /// Concurrent instance fetchers per build (default: 4)
    pub fetch_workers: usize,
    /// Linear backoff between build attempts
    pub retry_backoff_ms: u64,
    /// Scratch directory; must share a filesystem with the archive root
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            build_attempts: 3,
            fetch_workers: 4,
            retry_backoff_ms: 0,
            scratch_dir: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for a daily rolling log file; stderr only when unset
    pub directory: Option<PathBuf>,
    /// Default filter when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
        .map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Parse JSON without validating
    pub fn from_json_str(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    /// Check every value is in its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "server_address",
                reason: "must not be empty".into(),
            });
        }

        if self.retention_window_days == 0 {
            return Err(ConfigError::Invalid {
                key: "retention_window_days",
                reason: "must be at least 1".into(),
            });
        }

        if !self.archive_root_path.is_absolute() {
            return Err(ConfigError::Invalid {
                key: "archive_root_path",
                reason: format!("must be absolute, got {}", self.archive_root_path.display()),
            });
        }

        if let Some(index) = self.configured_index_path() {
            if !index.is_absolute() {
                return Err(ConfigError::Invalid {
                    key: "backend_settings.path",
                    reason: format!("must be absolute, got {}", index.display()),
                });
            }
        }

        if let Some(scratch) = &self.pipeline.scratch_dir {
            if let Some(reason) = self.scratch_dir_conflict(scratch) {
                return Err(ConfigError::Invalid {
                    key: "pipeline.scratch_dir",
                    reason,
                });
            }
        }

        if !(1..=10).contains(&self.pipeline.build_attempts) {
            return Err(ConfigError::Invalid {
                key: "pipeline.build_attempts",
                reason: format!("must be 1-10, got {}", self.pipeline.build_attempts),
            });
        }

        if !(1..=64).contains(&self.pipeline.fetch_workers) {
            return Err(ConfigError::Invalid {
                key: "pipeline.fetch_workers",
                reason: format!("must be 1-64, got {}", self.pipeline.fetch_workers),
            });
        }

        if !(1..=3600).contains(&self.source.request_timeout_secs) {
            return Err(ConfigError::Invalid {
                key: "source.request_timeout_secs",
                reason: format!("must be 1-3600, got {}", self.source.request_timeout_secs),
            });
        }

        Ok(())
    }

    /// Base URL of the source server, with scheme and without trailing slash
    pub fn server_url(&self) -> String {
        let address = self.server_address.trim().trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.retention_window_days)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_secs)
    }

    /// Location of the index store
    pub fn index_path(&self) -> PathBuf {
        self.configured_index_path().unwrap_or_else(|| {
            self.archive_root_path
                .join(self.database_backend.default_file_name())
        })
    }

    /// Why `scratch` cannot hold build leftovers, if it cannot
    ///
    /// Recovery clears the scratch directory, so it must not overlap the
    /// dated tree or the index.
    fn scratch_dir_conflict(&self, scratch: &Path) -> Option<String> {
        if !scratch.is_absolute() {
            return Some(format!("must be absolute, got {}", scratch.display()));
        }
        if scratch.components().any(|c| c == Component::ParentDir) {
            return Some(format!("must not contain '..', got {}", scratch.display()));
        }

        let root = &self.archive_root_path;
        if root.starts_with(scratch) {
            return Some(format!(
                "{} must not be or contain archive_root_path",
                scratch.display()
            ));
        }
        if let Ok(inside) = scratch.strip_prefix(root) {
            let in_bucket = inside
                .components()
                .next()
                .map_or(false, |first| is_date_bucket(&first.as_os_str().to_string_lossy()));
            if in_bucket {
                return Some(format!(
                    "{} is inside a dated archive directory",
                    scratch.display()
                ));
            }
        }
        if self.index_path().starts_with(scratch) {
            return Some(format!(
                "{} must not contain the index at {}",
                scratch.display(),
                self.index_path().display()
            ));
        }

        None
    }

    fn configured_index_path(&self) -> Option<PathBuf> {
        self.backend_settings
            .get("path")
            .or_else(|| self.backend_settings.get("FilePath"))
            .map(PathBuf::from)
    }
}

/// Example configuration with every setting spelled out
pub fn example_config() -> &'static str {
    r#"# pacs-retire configuration

# Source server address (scheme optional)
server_address = "127.0.0.1:8042"

# Days after the last update before a series is archived
retention_window_days = 180

# Dated archive tree: <archive_root_path>/<YYYYMMDD>/<series_id>.tar.gz
archive_root_path = "/srv/pacs-archive"

# Index backend: "sled" or "sqlite"
database_backend = "sled"

[backend_settings]
# path = "/srv/pacs-archive/index.sled"

[source]
# username = "orthanc"
# password = "orthanc"
request_timeout_secs = 30

[pipeline]
build_attempts = 3
fetch_workers = 4
retry_backoff_ms = 0
# scratch_dir = "/srv/pacs-archive/.scratch"

[logging]
# directory = "/var/log/pacs-retire"
level = "info"
"#
}
