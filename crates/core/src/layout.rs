//! Archive root layout
//!
//! ```text
//! <archive_root>/
//!   <YYYYMMDD>/
//!     <series_id>.tar.gz
//!   .scratch/
//!     <series_id>.tar.gz.partial
//!     <series_id>.spool/<instance_id>
//!   .pacs-retire.lock
//! ```
//!
//! Scratch must live on the same filesystem as the dated tree so that
//! promotion is a single `rename`.

use crate::error::ContainerError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Container file extension
pub const CONTAINER_EXTENSION: &str = "tar.gz";

const SCRATCH_DIR: &str = ".scratch";
const PARTIAL_SUFFIX: &str = ".partial";
const SPOOL_SUFFIX: &str = ".spool";

/// Paths inside an archive root
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
    scratch: PathBuf,
}

impl ArchiveLayout {
    /// Layout rooted at `root`, with scratch at `<root>/.scratch` unless overridden
    pub fn new(root: impl Into<PathBuf>, scratch: Option<PathBuf>) -> Self {
        let root = root.into();
        let scratch = scratch.unwrap_or_else(|| root.join(SCRATCH_DIR));
        Self { root, scratch }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Create the root and scratch directories if missing
    pub fn ensure_dirs(&self) -> Result<(), ContainerError> {
        fs::create_dir_all(&self.root).map_err(|e| ContainerError::io(&self.root, e))?;
        fs::create_dir_all(&self.scratch).map_err(|e| ContainerError::io(&self.scratch, e))?;
        Ok(())
    }

    /// Date bucket name for a timestamp (`YYYYMMDD`, UTC)
    pub fn date_bucket(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d").to_string()
    }

    /// Final, deterministic container path for a series archived at `at`
    pub fn container_path(&self, series_id: &str, at: DateTime<Utc>) -> Result<PathBuf, ContainerError> {
        check_series_id(series_id)?;
        Ok(self
            .root
            .join(Self::date_bucket(at))
            .join(format!("{}.{}", series_id, CONTAINER_EXTENSION)))
    }

    /// Scratch path the container is written to before promotion
    pub fn scratch_container_path(&self, series_id: &str) -> Result<PathBuf, ContainerError> {
        check_series_id(series_id)?;
        Ok(self.scratch.join(format!(
            "{}.{}{}",
            series_id, CONTAINER_EXTENSION, PARTIAL_SUFFIX
        )))
    }

    /// Scratch directory holding per-instance spool files during a build
    pub fn spool_dir(&self, series_id: &str) -> Result<PathBuf, ContainerError> {
        check_series_id(series_id)?;
        Ok(self.scratch.join(format!("{}{}", series_id, SPOOL_SUFFIX)))
    }

    /// Atomically move a finished scratch container to its final path
    ///
    /// Creates the dated directory, renames, then fsyncs the directory so
    /// the new entry survives a crash.
    pub fn promote(&self, scratch_path: &Path, final_path: &Path) -> Result<(), ContainerError> {
        let parent = final_path
            .parent()
            .ok_or_else(|| ContainerError::io(final_path, std::io::ErrorKind::InvalidInput.into()))?;
        fs::create_dir_all(parent).map_err(|e| ContainerError::io(parent, e))?;

        if final_path.exists() {
            // No committed record can point here, otherwise begin() would have refused the series
            warn!(path = %final_path.display(), "Replacing unreferenced container at final path");
        }

        fs::rename(scratch_path, final_path).map_err(|e| ContainerError::io(final_path, e))?;
        sync_dir(parent).map_err(|e| ContainerError::io(parent, e))?;

        debug!(from = %scratch_path.display(), to = %final_path.display(), "Promoted container");
        Ok(())
    }

    /// Remove partial containers and spool directories left in scratch
    ///
    /// Anything else in the scratch directory is left alone. Returns the
    /// number of entries removed.
    pub fn clear_scratch(&self) -> Result<usize, ContainerError> {
        if !self.scratch.exists() {
            return Ok(0);
        }

        let partial_suffix = format!(".{}{}", CONTAINER_EXTENSION, PARTIAL_SUFFIX);
        let mut removed = 0;
        for entry in fs::read_dir(&self.scratch).map_err(|e| ContainerError::io(&self.scratch, e))? {
            let entry = entry.map_err(|e| ContainerError::io(&self.scratch, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| ContainerError::io(&path, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let result = if file_type.is_dir() && name.ends_with(SPOOL_SUFFIX) {
                fs::remove_dir_all(&path)
            } else if file_type.is_file() && name.ends_with(&partial_suffix) {
                fs::remove_file(&path)
            } else {
                continue;
            };
            result.map_err(|e| ContainerError::io(&path, e))?;
            removed += 1;
        }

        Ok(removed)
    }
}

/// Whether a directory name is a date bucket (`YYYYMMDD`)
pub fn is_date_bucket(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Check that an identifier can be used as a single file name
///
/// Rejects empty names, separators, NUL, and names starting with `.`.
pub fn is_valid_component(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0']) && id.len() <= 200
}

fn check_series_id(series_id: &str) -> Result<(), ContainerError> {
    if is_valid_component(series_id) {
        Ok(())
    } else {
        Err(ContainerError::InvalidSeriesId(series_id.to_string()))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_container_path_is_dated() {
        let layout = ArchiveLayout::new("/archive", None);
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 23, 59, 0).unwrap();
        assert_eq!(
            layout.container_path("S1", at).unwrap(),
            PathBuf::from("/archive/20240105/S1.tar.gz")
        );
        assert_eq!(layout.scratch_dir(), Path::new("/archive/.scratch"));
    }

    #[test]
    fn test_unsafe_series_ids_rejected() {
        let layout = ArchiveLayout::new("/archive", None);
        for id in ["", "..", ".scratch", "a/b", "a\\b"] {
            assert!(
                matches!(layout.container_path(id, Utc::now()), Err(ContainerError::InvalidSeriesId(_))),
                "{:?} should be rejected",
                id
            );
        }
        assert!(layout
            .container_path("1b5a1c0e-4f2e6b7d-8a9c0d1e-2f3a4b5c-6d7e8f90", Utc::now())
            .is_ok());
    }

    #[test]
    fn test_promote_moves_file() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(temp_dir.path(), None);
        layout.ensure_dirs().unwrap();

        let scratch = layout.scratch_container_path("S1").unwrap();
        fs::write(&scratch, b"container").unwrap();

        let target = layout.container_path("S1", Utc::now()).unwrap();
        layout.promote(&scratch, &target).unwrap();

        assert!(!scratch.exists());
        assert_eq!(fs::read(&target).unwrap(), b"container");
    }

    #[test]
    fn test_clear_scratch() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(temp_dir.path(), None);
        layout.ensure_dirs().unwrap();

        fs::write(layout.scratch_container_path("S1").unwrap(), b"partial").unwrap();
        let spool = layout.spool_dir("S2").unwrap();
        fs::create_dir_all(&spool).unwrap();
        fs::write(spool.join("I1"), b"bytes").unwrap();

        assert_eq!(layout.clear_scratch().unwrap(), 2);
        assert_eq!(fs::read_dir(layout.scratch_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_scratch_keeps_foreign_entries() {
        let temp_dir = TempDir::new().unwrap();
        // Scratch shared with the archive root itself
        let layout = ArchiveLayout::new(temp_dir.path(), Some(temp_dir.path().to_path_buf()));
        layout.ensure_dirs().unwrap();

        let container = layout.container_path("S1", Utc::now()).unwrap();
        fs::create_dir_all(container.parent().unwrap()).unwrap();
        fs::write(&container, b"committed").unwrap();
        fs::write(temp_dir.path().join("S1.tar.gz"), b"not ours").unwrap();
        fs::create_dir_all(temp_dir.path().join("index.sled")).unwrap();
        fs::write(temp_dir.path().join("notes.partial"), b"not ours").unwrap();

        fs::write(layout.scratch_container_path("S2").unwrap(), b"partial").unwrap();
        fs::create_dir_all(layout.spool_dir("S3").unwrap()).unwrap();

        assert_eq!(layout.clear_scratch().unwrap(), 2);
        assert!(container.exists());
        assert!(temp_dir.path().join("S1.tar.gz").exists());
        assert!(temp_dir.path().join("index.sled").is_dir());
        assert!(temp_dir.path().join("notes.partial").exists());
        assert!(!layout.scratch_container_path("S2").unwrap().exists());
        assert!(!layout.spool_dir("S3").unwrap().exists());
    }

    #[test]
    fn test_date_bucket_names() {
        assert!(is_date_bucket("20240105"));
        assert!(is_date_bucket(&ArchiveLayout::date_bucket(Utc::now())));
        assert!(!is_date_bucket(".scratch"));
        assert!(!is_date_bucket("2024010"));
        assert!(!is_date_bucket("2024-01-05"));
    }
}
