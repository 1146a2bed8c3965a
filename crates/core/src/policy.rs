//! Retention policy

use chrono::{DateTime, Duration, Utc};

/// Returns true iff the series has been untouched for strictly longer than
/// the retention window.
pub fn is_eligible(last_update: DateTime<Utc>, now: DateTime<Utc>, retention_window: Duration) -> bool {
    now - last_update > retention_window
}

/// Retention policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a series stays on the source after its last update
    pub retention_window: Duration,
}

impl RetentionPolicy {
    /// Create a policy with a window of whole days
    pub fn from_days(days: u32) -> Self {
        Self {
            retention_window: Duration::days(i64::from(days)),
        }
    }

    /// Check whether a series last updated at `last_update` may be archived
    pub fn is_eligible(&self, last_update: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        is_eligible(last_update, now, self.retention_window)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(180)
    }
}
