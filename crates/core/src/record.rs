//! Archive record data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of an archive record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Archive operation in flight; the source must not be touched
    Pending,
    /// Container is complete and at its final path; safe to delete from source
    Committed,
}

impl RecordStatus {
    /// Stable string form used by the SQL backend
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Committed => "COMMITTED",
        }
    }

    /// Parse the stable string form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(RecordStatus::Pending),
            "COMMITTED" => Some(RecordStatus::Committed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archived (or in-flight) series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Unique key
    pub series_id: String,
    pub study_id: String,
    pub patient_id: String,
    pub status: RecordStatus,
    /// When the PENDING row was created
    pub begun_at: DateTime<Utc>,
    /// Set on commit
    pub archived_at: Option<DateTime<Utc>>,
    /// Absolute path of the finished container, set on commit
    pub container_path: Option<PathBuf>,
    pub instance_count: u32,
    pub container_bytes: u64,
    /// Hex BLAKE3 digest of the container file
    pub container_blake3: Option<String>,
}

impl ArchiveRecord {
    /// Create a new PENDING record
    pub fn pending(
        series_id: impl Into<String>,
        study_id: impl Into<String>,
        patient_id: impl Into<String>,
        begun_at: DateTime<Utc>,
    ) -> Self {
        Self {
            series_id: series_id.into(),
            study_id: study_id.into(),
            patient_id: patient_id.into(),
            status: RecordStatus::Pending,
            begun_at,
            archived_at: None,
            container_path: None,
            instance_count: 0,
            container_bytes: 0,
            container_blake3: None,
        }
    }

    /// Apply a commit, producing the COMMITTED form of this record
    pub fn committed(mut self, info: CommitInfo) -> Self {
        self.status = RecordStatus::Committed;
        self.archived_at = Some(info.archived_at);
        self.container_path = Some(info.container_path);
        self.instance_count = info.instance_count;
        self.container_bytes = info.container_bytes;
        self.container_blake3 = Some(info.container_blake3);
        self
    }

    pub fn is_committed(&self) -> bool {
        self.status == RecordStatus::Committed
    }
}

/// Facts about a finished container, stored when a record is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub container_path: PathBuf,
    pub archived_at: DateTime<Utc>,
    pub instance_count: u32,
    pub container_bytes: u64,
    pub container_blake3: String,
}

/// Filter for listing committed records
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub patient_id: Option<String>,
    pub study_id: Option<String>,
    /// Inclusive lower bound on `archived_at`
    pub archived_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `archived_at`
    pub archived_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    /// Check whether a record passes the filter
    ///
    /// Only COMMITTED records ever match.
    pub fn matches(&self, record: &ArchiveRecord) -> bool {
        if !record.is_committed() {
            return false;
        }
        if let Some(patient) = &self.patient_id {
            if &record.patient_id != patient {
                return false;
            }
        }
        if let Some(study) = &self.study_id {
            if &record.study_id != study {
                return false;
            }
        }
        match record.archived_at {
            Some(at) => {
                self.archived_after.map_or(true, |after| at >= after)
                    && self.archived_before.map_or(true, |before| at < before)
            }
            None => self.archived_after.is_none() && self.archived_before.is_none(),
        }
    }
}
