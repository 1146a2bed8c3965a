//! Series container builder
//!
//! Instances are fetched by up to `fetch_workers` concurrent tasks, each
//! streaming one payload into its own spool file under the scratch
//! directory. A single blocking writer drains a bounded channel and copies
//! spools into the tar.gz stream in instance order, parking spools that
//! arrive early and deleting each one once appended. The
//! finished container is fsynced, promoted with one `rename` and verified
//! in place.
//!
//! ```text
//! fetcher ─┐
//! fetcher ─┼─> mpsc(workers) ─> writer ─> .scratch/<id>.tar.gz.partial ─rename─> <YYYYMMDD>/<id>.tar.gz
//! fetcher ─┘
//! ```

use crate::cancel::Cancellation;
use chrono::{DateTime, Utc};
use retire_core::container::entry_name;
use retire_core::hash::hash_file;
use retire_core::layout::is_valid_component;
use retire_core::{ArchiveLayout, CommitInfo, ContainerError, ContainerReader, ContainerWriter};
use retire_source::{SourceClient, SourceError};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Why a container build failed
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Series id is not a valid path component: {0:?}")]
    InvalidSeriesId(String),

    #[error("Series {0} has no instances")]
    EmptySeries(String),

    #[error("Failed to fetch instance {instance_id}: {source}")]
    Fetch {
        instance_id: String,
        #[source]
        source: SourceError,
    },

    #[error("Fetching instance {instance_id} exceeded {after:?}")]
    Timeout { instance_id: String, after: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The writer stopped before every instance was appended.
    #[error("Container incomplete: {written} of {expected} instances written")]
    Incomplete { expected: usize, written: usize },

    #[error("Build task failed: {0}")]
    Task(String),

    #[error("Build cancelled")]
    Cancelled,
}

impl BuildError {
    fn io(path: &Path, source: io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether another attempt at the same build may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BuildError::InvalidSeriesId(_) | BuildError::EmptySeries(_) | BuildError::Cancelled => false,
            BuildError::Fetch { source, .. } => {
                !matches!(source, SourceError::NotFound(_) | SourceError::Config(_))
            }
            BuildError::Container(ContainerError::InvalidInstanceId(_))
            | BuildError::Container(ContainerError::InvalidSeriesId(_)) => false,
            _ => true,
        }
    }
}

/// A promoted and verified container
#[derive(Debug, Clone)]
pub struct BuiltContainer {
    pub series_id: String,
    pub path: PathBuf,
    pub archived_at: DateTime<Utc>,
    pub instance_count: u32,
    pub container_bytes: u64,
    pub container_blake3: String,
}

impl BuiltContainer {
    /// Facts the index stores on commit
    pub fn commit_info(&self) -> CommitInfo {
        CommitInfo {
            container_path: self.path.clone(),
            archived_at: self.archived_at,
            instance_count: self.instance_count,
            container_bytes: self.container_bytes,
            container_blake3: self.container_blake3.clone(),
        }
    }
}

/// One fetched instance waiting in the scratch directory
#[derive(Debug)]
struct Spooled {
    /// Index of the instance in the series order
    position: usize,
    instance_id: String,
    path: PathBuf,
    len: u64,
}

/// Builds one container per series from source instances
pub struct ArchiveBuilder {
    layout: ArchiveLayout,
    source: Arc<dyn SourceClient>,
    fetch_workers: usize,
    fetch_timeout: Duration,
}

impl ArchiveBuilder {
    pub fn new(
        layout: ArchiveLayout,
        source: Arc<dyn SourceClient>,
        fetch_workers: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            layout,
            source,
            fetch_workers: fetch_workers.max(1),
            fetch_timeout,
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Fetch, pack, promote and verify one series
    ///
    /// On any failure nothing is left behind: spools and the scratch
    /// container are removed, and a promoted container that fails
    /// verification is deleted.
    pub async fn build(
        &self,
        series_id: &str,
        instance_ids: &[String],
        archived_at: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<BuiltContainer, BuildError> {
        if !is_valid_component(series_id) {
            return Err(BuildError::InvalidSeriesId(series_id.to_string()));
        }

        let mut seen = HashSet::with_capacity(instance_ids.len());
        let ids: Vec<String> = instance_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(BuildError::EmptySeries(series_id.to_string()));
        }
        for id in &ids {
            entry_name(id)?;
        }

        let scratch_path = self.layout.scratch_container_path(series_id)?;
        let spool_dir = self.layout.spool_dir(series_id)?;
        let final_path = self.layout.container_path(series_id, archived_at)?;

        let result = self
            .build_in_scratch(&ids, &scratch_path, &spool_dir, &final_path, archived_at, cancel)
            .await;

        remove_if_exists(&spool_dir).await;
        if result.is_err() {
            remove_if_exists(&scratch_path).await;
        }

        let (instance_count, digest) = result?;
        info!(
            series_id,
            instances = instance_count,
            bytes = digest.len,
            path = %final_path.display(),
            "Built container"
        );

        Ok(BuiltContainer {
            series_id: series_id.to_string(),
            path: final_path,
            archived_at,
            instance_count: instance_count as u32,
            container_bytes: digest.len,
            container_blake3: digest.blake3,
        })
    }

    async fn build_in_scratch(
        &self,
        ids: &[String],
        scratch_path: &Path,
        spool_dir: &Path,
        final_path: &Path,
        archived_at: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<(usize, retire_core::hash::FileDigest), BuildError> {
        self.layout.ensure_dirs()?;
        tokio::fs::create_dir_all(spool_dir)
            .await
            .map_err(|e| BuildError::io(spool_dir, e))?;

        let (tx, rx) = mpsc::channel(self.fetch_workers);
        let writer = tokio::task::spawn_blocking({
            let scratch_path = scratch_path.to_path_buf();
            let mtime = archived_at.timestamp().max(0) as u64;
            let expected = ids.len();
            let cancel = cancel.clone();
            move || write_container(&scratch_path, mtime, expected, rx, &cancel)
        });

        let fetched = self.fetch_all(ids, spool_dir, tx, cancel).await;
        let written = match writer.await {
            Ok(result) => result,
            Err(e) => Err(BuildError::Task(e.to_string())),
        };
        fetched.and(written)?;

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let layout = self.layout.clone();
        let scratch_path = scratch_path.to_path_buf();
        let final_path = final_path.to_path_buf();
        let expected = ids.to_vec();
        tokio::task::spawn_blocking(move || promote_and_verify(&layout, &scratch_path, &final_path, &expected))
            .await
            .map_err(|e| BuildError::Task(e.to_string()))?
    }

    /// Run the fetchers, handing every spooled instance to the writer
    ///
    /// Returns `Ok` early if the writer hung up; its own error explains why.
    /// Outstanding fetches are aborted and awaited before returning.
    async fn fetch_all(
        &self,
        ids: &[String],
        spool_dir: &Path,
        tx: mpsc::Sender<Spooled>,
        cancel: &Cancellation,
    ) -> Result<(), BuildError> {
        let mut queue = ids.iter().enumerate();
        let mut in_flight = JoinSet::new();

        let result = loop {
            while in_flight.len() < self.fetch_workers {
                let Some((position, id)) = queue.next() else { break };
                in_flight.spawn(fetch_to_spool(
                    Arc::clone(&self.source),
                    position,
                    id.clone(),
                    spool_dir.join(id),
                    self.fetch_timeout,
                ));
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                _ = cancel.cancelled() => break Err(BuildError::Cancelled),
            };
            let spooled = match joined {
                None => break Ok(()),
                Some(Ok(Ok(spooled))) => spooled,
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(BuildError::Task(e.to_string())),
            };

            debug!(instance_id = %spooled.instance_id, bytes = spooled.len, "Spooled instance");
            if tx.send(spooled).await.is_err() {
                break Ok(());
            }
        };

        in_flight.shutdown().await;
        result
    }
}

async fn fetch_to_spool(
    source: Arc<dyn SourceClient>,
    position: usize,
    instance_id: String,
    path: PathBuf,
    limit: Duration,
) -> Result<Spooled, BuildError> {
    // Created synchronously so an aborted fetch never creates a spool later
    let file = fs::File::create(&path).map_err(|e| BuildError::io(&path, e))?;
    let mut file = tokio::fs::File::from_std(file);

    let len = match tokio::time::timeout(limit, source.fetch_instance(&instance_id, &mut file)).await {
        Ok(fetched) => fetched.map_err(|source| BuildError::Fetch {
            instance_id: instance_id.clone(),
            source,
        })?,
        Err(_) => {
            return Err(BuildError::Timeout {
                instance_id,
                after: limit,
            })
        }
    };
    file.flush().await.map_err(|e| BuildError::io(&path, e))?;

    Ok(Spooled {
        position,
        instance_id,
        path,
        len,
    })
}

/// Drain spooled instances into a new container at `scratch_path`
fn write_container(
    scratch_path: &Path,
    mtime: u64,
    expected: usize,
    mut rx: mpsc::Receiver<Spooled>,
    cancel: &Cancellation,
) -> Result<(), BuildError> {
    let mut writer = ContainerWriter::create(scratch_path, mtime)?;
    let mut parked = BTreeMap::new();
    let mut next = 0;

    while let Some(spooled) = rx.blocking_recv() {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        parked.insert(spooled.position, spooled);
        while let Some(ready) = parked.remove(&next) {
            append_spool(&mut writer, &ready)?;
            next += 1;
        }
    }

    if writer.entries() != expected {
        return Err(BuildError::Incomplete {
            expected,
            written: writer.entries(),
        });
    }

    writer.finish()?;
    Ok(())
}

fn append_spool(writer: &mut ContainerWriter, spooled: &Spooled) -> Result<(), BuildError> {
    let file = fs::File::open(&spooled.path).map_err(|e| BuildError::io(&spooled.path, e))?;
    writer.append_instance(&spooled.instance_id, spooled.len, BufReader::new(file))?;
    fs::remove_file(&spooled.path).map_err(|e| BuildError::io(&spooled.path, e))?;
    Ok(())
}

fn promote_and_verify(
    layout: &ArchiveLayout,
    scratch_path: &Path,
    final_path: &Path,
    expected: &[String],
) -> Result<(usize, retire_core::hash::FileDigest), BuildError> {
    layout.promote(scratch_path, final_path)?;

    let checked = ContainerReader::open(final_path)
        .and_then(|reader| reader.verify(expected))
        .map_err(BuildError::from)
        .and_then(|count| {
            let digest = hash_file(final_path).map_err(|e| BuildError::io(final_path, e))?;
            Ok((count, digest))
        });

    if checked.is_err() {
        if let Err(e) = fs::remove_file(final_path) {
            warn!(path = %final_path.display(), error = %e, "Failed to remove unverified container");
        }
    }
    checked
}

async fn remove_if_exists(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to clean up scratch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use retire_source::MemorySource;
    use tempfile::TempDir;

    fn archived_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    fn setup(instances: usize) -> (TempDir, Arc<MemorySource>, ArchiveBuilder) {
        let temp_dir = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new());
        source.add_series(
            "S1",
            "ST1",
            "P1",
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            (0..instances)
                .map(|i| (format!("I{}", i), vec![i as u8; 30_000 + i]))
                .collect(),
        );

        let layout = ArchiveLayout::new(temp_dir.path().join("archive"), None);
        let builder = ArchiveBuilder::new(layout, source.clone(), 3, Duration::from_secs(5));
        (temp_dir, source, builder)
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("I{}", i)).collect()
    }

    fn scratch_is_empty(builder: &ArchiveBuilder) -> bool {
        fs::read_dir(builder.layout().scratch_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_build_promotes_verified_container() {
        let (_dir, source, builder) = setup(7);
        let built = builder
            .build("S1", &ids(7), archived_at(), &Cancellation::new())
            .await
            .unwrap();

        assert!(built.path.ends_with("20240301/S1.tar.gz"));
        assert_eq!(built.instance_count, 7);
        assert_eq!(built.container_bytes, fs::metadata(&built.path).unwrap().len());
        assert_eq!(built.container_blake3, hash_file(&built.path).unwrap().blake3);
        assert!(scratch_is_empty(&builder));

        let reader = ContainerReader::open(&built.path).unwrap();
        reader
            .for_each_instance(|id, payload| {
                let mut bytes = Vec::new();
                io::Read::read_to_end(payload, &mut bytes)?;
                assert_eq!(Some(bytes), source.instance_bytes(id));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_entries_follow_series_order() {
        let (_dir, source, builder) = setup(5);
        // I0 finishes last, after every other fetch has been spooled
        source.stall_instance("I0", Duration::from_millis(200));

        let built = builder
            .build("S1", &ids(5), archived_at(), &Cancellation::new())
            .await
            .unwrap();

        let reader = ContainerReader::open(&built.path).unwrap();
        assert_eq!(reader.instance_ids().unwrap(), ids(5));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_nothing_behind() {
        let (_dir, source, builder) = setup(5);
        source.fail_instance("I3", usize::MAX);

        let err = builder
            .build("S1", &ids(5), archived_at(), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Fetch { ref instance_id, .. } if instance_id == "I3"));
        assert!(err.is_retryable());
        assert!(scratch_is_empty(&builder));
        assert!(!builder
            .layout()
            .container_path("S1", archived_at())
            .unwrap()
            .exists());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let (_dir, _source, builder) = setup(1);
        let cancel = Cancellation::new();

        let err = builder.build("S1", &[], archived_at(), &cancel).await.unwrap_err();
        assert!(matches!(err, BuildError::EmptySeries(_)));
        assert!(!err.is_retryable());

        let err = builder
            .build("../S1", &ids(1), archived_at(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidSeriesId(_)));

        let err = builder
            .build("S1", &["a/b".to_string()], archived_at(), &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_retryable() {
        let (_dir, _source, builder) = setup(1);
        let err = builder
            .build("S1", &["nope".to_string()], archived_at(), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let (_dir, source, builder) = setup(2);
        let builder = ArchiveBuilder::new(
            builder.layout().clone(),
            source.clone(),
            2,
            Duration::from_millis(50),
        );
        source.stall_instance("I1", Duration::from_secs(2));

        let err = builder
            .build("S1", &ids(2), archived_at(), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { .. }));
        assert!(scratch_is_empty(&builder));
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let (_dir, source, builder) = setup(2);
        source.stall_instance("I0", Duration::from_secs(2));
        let cancel = Cancellation::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let err = builder.build("S1", &ids(2), archived_at(), &cancel).await.unwrap_err();
        trigger.await.unwrap();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(scratch_is_empty(&builder));
    }
}
