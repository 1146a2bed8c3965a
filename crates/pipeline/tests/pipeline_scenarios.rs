//! End-to-end retention runs against the in-memory source

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use retire_core::{
    ArchiveLayout, ArchiveRecord, CommitInfo, ContainerReader, RecordFilter, RecordStatus, RetentionPolicy,
};
use retire_index::{ArchiveIndex, IndexError, RecordIter, SledIndex};
use retire_pipeline::{Cancellation, PipelineError, PipelineOptions, RetentionPipeline};
use retire_source::MemorySource;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _temp_dir: TempDir,
    root: PathBuf,
    source: Arc<MemorySource>,
    index: Arc<SledIndex>,
    now: DateTime<Utc>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("archive");
        let index = Arc::new(SledIndex::open(&temp_dir.path().join("index.sled")).unwrap());

        Self {
            _temp_dir: temp_dir,
            root,
            source: Arc::new(MemorySource::new()),
            index,
            now: Utc::now(),
        }
    }

    /// Add a series of `instances` payloads last updated `age_days` ago
    fn add_series(&self, series_id: &str, age_days: i64, instances: usize) {
        self.source.add_series(
            series_id,
            &format!("{}-study", series_id),
            "P1",
            self.now - ChronoDuration::days(age_days),
            (0..instances)
                .map(|i| {
                    let id = format!("{}-I{}", series_id, i);
                    let bytes = format!("payload of {}", id).repeat(1000 + i).into_bytes();
                    (id, bytes)
                })
                .collect(),
        );
    }

    fn layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(&self.root, None)
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            policy: RetentionPolicy::from_days(180),
            build_attempts: 3,
            fetch_workers: 2,
            retry_backoff: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn pipeline(&self) -> RetentionPipeline {
        self.pipeline_with(Self::options(), self.index.clone())
    }

    fn pipeline_with(&self, options: PipelineOptions, index: Arc<dyn ArchiveIndex>) -> RetentionPipeline {
        RetentionPipeline::new(options, self.source.clone(), index, self.layout())
    }

    fn containers(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(buckets) = fs::read_dir(&self.root) else {
            return found;
        };
        for bucket in buckets {
            let bucket = bucket.unwrap().path();
            if bucket.file_name().unwrap() == ".scratch" || !bucket.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&bucket).unwrap() {
                found.push(entry.unwrap().path());
            }
        }
        found
    }

    fn scratch_is_empty(&self) -> bool {
        fs::read_dir(self.layout().scratch_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

fn read_container(path: &Path) -> HashMap<String, Vec<u8>> {
    let mut entries = HashMap::new();
    ContainerReader::open(path)
        .unwrap()
        .for_each_instance(|id, payload| {
            let mut bytes = Vec::new();
            payload.read_to_end(&mut bytes)?;
            entries.insert(id.to_string(), bytes);
            Ok(())
        })
        .unwrap();
    entries
}

/// How `CommitFailingIndex` refuses a commit
#[derive(Clone, Copy)]
enum CommitFault {
    DiskFull,
    RecordMissing,
}

/// Index that refuses every commit
struct CommitFailingIndex(Arc<SledIndex>, CommitFault);

impl ArchiveIndex for CommitFailingIndex {
    fn begin_at(
        &self,
        series_id: &str,
        study_id: &str,
        patient_id: &str,
        begun_at: DateTime<Utc>,
    ) -> Result<ArchiveRecord, IndexError> {
        self.0.begin_at(series_id, study_id, patient_id, begun_at)
    }

    fn commit(&self, series_id: &str, _info: CommitInfo) -> Result<ArchiveRecord, IndexError> {
        match self.1 {
            CommitFault::DiskFull => Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            ))),
            CommitFault::RecordMissing => Err(IndexError::RecordNotFound(series_id.to_string())),
        }
    }

    fn abort(&self, series_id: &str) -> Result<bool, IndexError> {
        self.0.abort(series_id)
    }

    fn find_pending(&self) -> Result<Vec<ArchiveRecord>, IndexError> {
        self.0.find_pending()
    }

    fn list_committed(&self, filter: RecordFilter) -> RecordIter<'_> {
        self.0.list_committed(filter)
    }

    fn get(&self, series_id: &str) -> Result<Option<ArchiveRecord>, IndexError> {
        self.0.get(series_id)
    }
}

#[tokio::test]
async fn test_aged_series_is_archived_then_deleted() {
    let h = Harness::new();
    h.add_series("S1", 200, 3);
    let originals: HashMap<String, Vec<u8>> = (0..3)
        .map(|i| {
            let id = format!("S1-I{}", i);
            let bytes = h.source.instance_bytes(&id).unwrap();
            (id, bytes)
        })
        .collect();

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.archived, 1);
    assert!(summary.is_clean());
    assert!(!h.source.contains_series("S1"));

    let record = h.index.get("S1").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Committed);
    assert_eq!(record.instance_count, 3);
    assert_eq!(record.patient_id, "P1");

    let container = record.container_path.unwrap();
    assert!(container.starts_with(&h.root));
    assert_eq!(
        container.parent().unwrap().file_name().unwrap().to_string_lossy(),
        ArchiveLayout::date_bucket(record.begun_at)
    );
    assert_eq!(fs::metadata(&container).unwrap().len(), record.container_bytes);

    // Round trip: same instance set, same bytes
    assert_eq!(read_container(&container), originals);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_rerun_skips_duplicate_without_new_container() {
    let h = Harness::new();
    h.add_series("S1", 200, 3);
    h.source.fail_delete("S1");

    let first = h.pipeline().run_at(h.now).await.unwrap();
    assert_eq!(first.archived, 1);
    assert_eq!(first.delete_failed, 1);
    assert!(h.source.contains_series("S1"));
    assert!(h.index.get("S1").unwrap().unwrap().is_committed());
    let fetches = h.source.fetch_count("S1-I0");

    let second = h.pipeline().run_at(h.now).await.unwrap();
    assert_eq!(second.archived, 0);
    assert_eq!(second.skipped_duplicate, 1);
    assert_eq!(h.source.fetch_count("S1-I0"), fetches);
    assert_eq!(h.containers().len(), 1);
    assert_eq!(h.index.count(), 1);
}

#[tokio::test]
async fn test_persistent_fetch_failure_leaves_source_untouched() {
    let h = Harness::new();
    h.add_series("S1", 200, 3);
    h.source.fail_instance("S1-I1", 3);

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.archived, 0);
    assert_eq!(h.source.fetch_count("S1-I1"), 3);
    assert!(h.source.contains_series("S1"));
    assert!(h.source.delete_calls().is_empty());
    assert!(h.index.get("S1").unwrap().is_none());
    assert!(h.containers().is_empty());
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_transient_fetch_failure_is_retried() {
    let h = Harness::new();
    h.add_series("S1", 200, 3);
    h.source.fail_instance("S1-I1", 2);

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.archived, 1);
    assert_eq!(h.source.fetch_count("S1-I1"), 3);
    assert!(!h.source.contains_series("S1"));
}

#[tokio::test]
async fn test_commit_failure_halts_before_delete() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    h.add_series("S2", 200, 2);

    let failing: Arc<dyn ArchiveIndex> = Arc::new(CommitFailingIndex(h.index.clone(), CommitFault::DiskFull));
    let err = h
        .pipeline_with(Harness::options(), failing)
        .run_at(h.now)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::IndexCommit { ref series_id, .. } if series_id == "S1"));
    assert!(h.source.delete_calls().is_empty());
    assert!(h.source.contains_series("S1"));
    assert!(h.source.contains_series("S2"));
    assert_eq!(h.index.get("S1").unwrap().unwrap().status, RecordStatus::Pending);

    // The next healthy run recovers the orphan and archives both
    let summary = h.pipeline().run_at(h.now).await.unwrap();
    assert_eq!(summary.recovered_pending, 1);
    assert_eq!(summary.archived, 2);
    assert_eq!(h.containers().len(), 2);
}

#[tokio::test]
async fn test_missing_record_on_commit_halts_before_delete() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    h.add_series("S2", 200, 2);

    let failing: Arc<dyn ArchiveIndex> = Arc::new(CommitFailingIndex(h.index.clone(), CommitFault::RecordMissing));
    let err = h
        .pipeline_with(Harness::options(), failing)
        .run_at(h.now)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::RecordNotFound(ref id) if id == "S1"));
    assert!(h.source.delete_calls().is_empty());
    assert!(h.source.contains_series("S1"));
    assert!(h.source.contains_series("S2"));
    assert!(h.index.get("S2").unwrap().is_none());
}

#[tokio::test]
async fn test_recovery_keeps_committed_containers_in_shared_scratch() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    // Scratch is the archive root itself
    let layout = ArchiveLayout::new(&h.root, Some(h.root.clone()));
    let pipeline = || RetentionPipeline::new(Harness::options(), h.source.clone(), h.index.clone(), layout.clone());

    let first = pipeline().run_at(h.now).await.unwrap();
    assert_eq!(first.archived, 1);
    let container = h.index.get("S1").unwrap().unwrap().container_path.unwrap();
    assert!(container.exists());

    fs::write(h.root.join("S2.tar.gz.partial"), b"partial").unwrap();
    let second = pipeline().run_at(h.now).await.unwrap();
    assert_eq!(second.archived, 0);

    assert!(h.index.get("S1").unwrap().unwrap().is_committed());
    assert!(container.exists());
    assert_eq!(read_container(&container).len(), 2);
    assert!(!h.root.join("S2.tar.gz.partial").exists());
}

#[tokio::test]
async fn test_ineligible_series_is_never_touched() {
    let h = Harness::new();
    h.add_series("S1", 100, 2);
    h.add_series("S2", 180, 2);

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.skipped_ineligible, 2);
    assert_eq!(summary.archived, 0);
    assert_eq!(h.source.fetch_count("S1-I0"), 0);
    assert_eq!(h.source.fetch_count("S2-I0"), 0);
    assert!(h.index.get("S1").unwrap().is_none());
    assert!(h.source.delete_calls().is_empty());
}

#[tokio::test]
async fn test_recovery_aborts_pending_and_removes_partial_output() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);

    // Simulate a crash after promotion but before commit
    let begun_at = h.now - ChronoDuration::days(1);
    h.index.begin_at("S1", "S1-study", "P1", begun_at).unwrap();
    let layout = h.layout();
    let orphan = layout.container_path("S1", begun_at).unwrap();
    fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    fs::write(&orphan, b"half a container").unwrap();
    fs::create_dir_all(layout.scratch_dir()).unwrap();
    fs::write(layout.scratch_dir().join("S1.tar.gz.partial"), b"partial").unwrap();

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.recovered_pending, 1);
    assert_eq!(summary.archived, 1);
    assert!(!orphan.exists());
    assert!(h.scratch_is_empty());
    assert!(h.index.find_pending().unwrap().is_empty());
    assert_eq!(h.containers().len(), 1);

    let record = h.index.get("S1").unwrap().unwrap();
    assert_eq!(read_container(record.container_path.as_ref().unwrap()).len(), 2);
}

#[tokio::test]
async fn test_recover_alone_reports_aborted_records() {
    let h = Harness::new();
    h.index.begin("S7", "ST", "P").unwrap();
    h.index.begin("S8", "ST", "P").unwrap();

    let pipeline = h.pipeline();
    assert_eq!(pipeline.recover().unwrap(), 2);
    assert_eq!(pipeline.recover().unwrap(), 0);
    assert_eq!(h.index.count(), 0);
}

#[tokio::test]
async fn test_empty_series_counts_as_failed_without_retry() {
    let h = Harness::new();
    h.add_series("S1", 200, 0);

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert!(h.index.get("S1").unwrap().is_none());
    assert!(h.source.contains_series("S1"));
}

#[tokio::test]
async fn test_one_bad_series_does_not_stop_the_run() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    h.add_series("S2", 200, 2);
    h.add_series("S3", 200, 2);
    h.source.fail_instance("S2-I0", usize::MAX);

    let summary = h.pipeline().run_at(h.now).await.unwrap();

    assert_eq!(summary.archived, 2);
    assert_eq!(summary.failed, 1);
    assert!(h.source.contains_series("S2"));
    assert!(!h.source.contains_series("S1"));
    assert!(!h.source.contains_series("S3"));
}

#[tokio::test]
async fn test_fetch_timeout_fails_series() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    h.source.stall_instance("S1-I1", Duration::from_secs(3));

    let options = PipelineOptions {
        build_attempts: 1,
        request_timeout: Duration::from_millis(100),
        ..Harness::options()
    };
    let summary = h.pipeline_with(options, h.index.clone()).run_at(h.now).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert!(h.source.contains_series("S1"));
    assert!(h.containers().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_stops_before_next_series() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);

    let cancel = Cancellation::new();
    cancel.cancel();
    let summary = h
        .pipeline()
        .with_cancellation(cancel)
        .run_at(h.now)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.seen(), 0);
    assert!(h.source.contains_series("S1"));
    assert_eq!(h.source.fetch_count("S1-I0"), 0);
}

#[tokio::test]
async fn test_cancel_during_build_aborts_record() {
    let h = Harness::new();
    h.add_series("S1", 200, 2);
    h.source.stall_instance("S1-I0", Duration::from_secs(3));

    let pipeline = h.pipeline();
    let cancel = pipeline.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let summary = pipeline.run_at(h.now).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.archived, 0);
    assert!(h.index.get("S1").unwrap().is_none());
    assert!(h.source.contains_series("S1"));
    assert!(h.scratch_is_empty());
}
