//! Retention run driver
//!
//! Per series:
//!
//! ```text
//! SCANNED -> ELIGIBLE? -> BEGIN -> BUILD -> COMMIT -> DELETE -> DONE
//!               |no          |dup    |fail     |fail
//!             skip         skip    abort     halt run
//! ```
//!
//! A series is only deleted from the source after its COMMITTED record is
//! durable. Anything interrupted before commit leaves a PENDING record,
//! which `recover` aborts at the start of the next run.

use crate::builder::{ArchiveBuilder, BuildError, BuiltContainer};
use crate::cancel::Cancellation;
use crate::summary::RunSummary;
use crate::PipelineError;
use chrono::{DateTime, Utc};
use retire_core::{ArchiveLayout, Config, RetentionPolicy, SeriesMetadata};
use retire_index::{ArchiveIndex, IndexError};
use retire_source::SourceClient;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Tuning for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub policy: RetentionPolicy,
    /// Attempts per build, at least 1
    pub build_attempts: u32,
    pub fetch_workers: usize,
    /// Multiplied by the attempt number between failed builds
    pub retry_backoff: Duration,
    /// Upper bound on every source call made by the pipeline
    pub request_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::default(),
            build_attempts: 3,
            fetch_workers: 4,
            retry_backoff: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.retention_policy(),
            build_attempts: config.pipeline.build_attempts,
            fetch_workers: config.pipeline.fetch_workers,
            retry_backoff: Duration::from_millis(config.pipeline.retry_backoff_ms),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Drives scan, archive, commit and delete over a source server
pub struct RetentionPipeline {
    source: Arc<dyn SourceClient>,
    index: Arc<dyn ArchiveIndex>,
    layout: ArchiveLayout,
    builder: ArchiveBuilder,
    options: PipelineOptions,
    cancel: Cancellation,
}

impl RetentionPipeline {
    pub fn new(
        options: PipelineOptions,
        source: Arc<dyn SourceClient>,
        index: Arc<dyn ArchiveIndex>,
        layout: ArchiveLayout,
    ) -> Self {
        let builder = ArchiveBuilder::new(
            layout.clone(),
            Arc::clone(&source),
            options.fetch_workers,
            options.request_timeout,
        );

        Self {
            source,
            index,
            layout,
            builder,
            options,
            cancel: Cancellation::new(),
        }
    }

    /// Use an externally owned cancellation flag (e.g. wired to Ctrl-C)
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Abort every PENDING record and remove build leftovers from scratch
    ///
    /// A container found at a pending record's final path is removed
    /// before the record, so a crash here leaves the record for next time.
    /// Returns the number of records aborted.
    pub fn recover(&self) -> Result<usize, PipelineError> {
        let pending = self.index.find_pending().map_err(PipelineError::Recovery)?;

        for record in &pending {
            match self.layout.container_path(&record.series_id, record.begun_at) {
                Ok(path) => match fs::remove_file(&path) {
                    Ok(()) => {
                        info!(series_id = %record.series_id, path = %path.display(), "Removed uncommitted container")
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(series_id = %record.series_id, path = %path.display(), error = %e, "Failed to remove uncommitted container")
                    }
                },
                Err(e) => warn!(series_id = %record.series_id, error = %e, "Pending record has no valid container path"),
            }

            match self.index.abort(&record.series_id) {
                Ok(_) => info!(series_id = %record.series_id, begun_at = %record.begun_at, "Aborted pending record"),
                Err(e) => return Err(PipelineError::Recovery(e)),
            }
        }

        match self.layout.clear_scratch() {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Cleared scratch directory"),
            Err(e) => warn!(error = %e, "Failed to clear scratch directory"),
        }

        Ok(pending.len())
    }

    /// Run once against the current time
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        self.run_at(Utc::now()).await
    }

    /// Run once, judging eligibility against `now`
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        let span = info_span!("retention_run", run_id = %Ulid::new());
        self.run_inner(now).instrument(span).await
    }

    async fn run_inner(&self, now: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        self.layout.ensure_dirs()?;
        summary.recovered_pending = self.recover()?;

        let series_ids = self.source.list_series().await.map_err(PipelineError::Scan)?;
        info!(
            series = series_ids.len(),
            window_days = self.options.policy.retention_window.num_days(),
            "Scanning source"
        );

        for series_id in &series_ids {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.process_series(series_id, now, &mut summary).await?;
        }

        if self.cancel.is_cancelled() {
            summary.cancelled = true;
        }

        info!(
            archived = summary.archived,
            skipped_ineligible = summary.skipped_ineligible,
            skipped_duplicate = summary.skipped_duplicate,
            failed = summary.failed,
            delete_failed = summary.delete_failed,
            recovered_pending = summary.recovered_pending,
            cancelled = summary.cancelled,
            "Run finished"
        );
        Ok(summary)
    }

    async fn process_series(
        &self,
        series_id: &str,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let metadata = match self.source.get_series_metadata(series_id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(series_id, error = %e, "Failed to read series metadata");
                summary.failed += 1;
                return Ok(());
            }
        };

        if !self.options.policy.is_eligible(metadata.last_update, now) {
            debug!(series_id, last_update = %metadata.last_update, "Series within retention window");
            summary.skipped_ineligible += 1;
            return Ok(());
        }

        let study = match self.source.get_study_metadata(&metadata.study_id).await {
            Ok(study) => study,
            Err(e) => {
                warn!(series_id, study_id = %metadata.study_id, error = %e, "Failed to read parent study");
                summary.failed += 1;
                return Ok(());
            }
        };

        let record = match self.index.begin(series_id, &metadata.study_id, &study.patient_id) {
            Ok(record) => record,
            Err(IndexError::DuplicateSeries(_)) => {
                debug!(series_id, "Series already archived");
                summary.skipped_duplicate += 1;
                return Ok(());
            }
            Err(source) => {
                return Err(PipelineError::IndexBegin {
                    series_id: series_id.to_string(),
                    source,
                })
            }
        };

        // The container is bucketed by the claim time so recovery can find it
        let built = match self.build_with_retry(&metadata, record.begun_at).await {
            Ok(built) => built,
            Err(e) => {
                match self.index.abort(series_id) {
                    Ok(_) => {}
                    Err(abort_err) => {
                        warn!(series_id, error = %abort_err, "Failed to abort pending record; next run will recover it")
                    }
                }

                if matches!(e, BuildError::Cancelled) {
                    info!(series_id, "Build cancelled");
                    summary.cancelled = true;
                } else {
                    warn!(series_id, error = %e, "Failed to archive series");
                    summary.failed += 1;
                }
                return Ok(());
            }
        };

        match self.index.commit(series_id, built.commit_info()) {
            Ok(_) => {}
            Err(IndexError::RecordNotFound(id)) => return Err(PipelineError::RecordNotFound(id)),
            Err(source) => {
                return Err(PipelineError::IndexCommit {
                    series_id: series_id.to_string(),
                    source,
                })
            }
        }
        summary.archived += 1;
        info!(series_id, path = %built.path.display(), "Committed series");

        let deleted = tokio::time::timeout(self.options.request_timeout, self.source.delete_series(series_id)).await;
        match deleted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(series_id, error = %e, "Archived series could not be deleted from source");
                summary.delete_failed += 1;
            }
            Err(_) => {
                warn!(series_id, "Deleting archived series from source timed out");
                summary.delete_failed += 1;
            }
        }

        Ok(())
    }

    async fn build_with_retry(
        &self,
        metadata: &SeriesMetadata,
        archived_at: DateTime<Utc>,
    ) -> Result<BuiltContainer, BuildError> {
        let attempts = self.options.build_attempts.max(1);
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }

            let result = self
                .builder
                .build(&metadata.series_id, &metadata.instance_ids, archived_at, &self.cancel)
                .await;

            let err = match result {
                Ok(built) => return Ok(built),
                Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
                Err(e) => e,
            };

            warn!(
                series_id = %metadata.series_id,
                attempt,
                attempts,
                error = %err,
                "Build attempt failed, retrying"
            );

            let backoff = self.options.retry_backoff * attempt;
            if !backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
                }
            }
            attempt += 1;
        }
    }
}
