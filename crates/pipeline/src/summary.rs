//! Per-run counters

use serde::Serialize;
use std::fmt;

/// Outcome counts for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Series archived, committed and scheduled for deletion
    pub archived: usize,
    /// Series still within the retention window
    pub skipped_ineligible: usize,
    /// Series already tracked by the index
    pub skipped_duplicate: usize,
    /// Series whose metadata or build failed; left on the source
    pub failed: usize,
    /// Committed series the source refused to delete
    pub delete_failed: usize,
    /// PENDING records aborted by recovery at startup
    pub recovered_pending: usize,
    /// The run stopped early on request
    pub cancelled: bool,
}

impl RunSummary {
    /// Series looked at during the scan
    pub fn seen(&self) -> usize {
        self.archived + self.skipped_ineligible + self.skipped_duplicate + self.failed
    }

    /// True when nothing needs operator attention
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.delete_failed == 0 && !self.cancelled
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "archived={} skipped_ineligible={} skipped_duplicate={} failed={} delete_failed={} recovered_pending={}",
            self.archived,
            self.skipped_ineligible,
            self.skipped_duplicate,
            self.failed,
            self.delete_failed,
            self.recovered_pending
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}
