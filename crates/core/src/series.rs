//! Read-only views of remote series and studies

use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Metadata of one series as reported by the source server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMetadata {
    /// Series identifier on the source server
    pub series_id: String,
    /// Parent study identifier
    pub study_id: String,
    /// Last time anything in the series changed
    pub last_update: DateTime<Utc>,
    /// Instance identifiers, unique, in server order
    pub instance_ids: Vec<String>,
}

impl SeriesMetadata {
    /// Create series metadata, collapsing repeated instance ids
    ///
    /// The first occurrence of an id keeps its position.
    pub fn new(
        series_id: impl Into<String>,
        study_id: impl Into<String>,
        last_update: DateTime<Utc>,
        instance_ids: Vec<String>,
    ) -> Self {
        let mut seen = HashSet::with_capacity(instance_ids.len());
        let instance_ids = instance_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Self {
            series_id: series_id.into(),
            study_id: study_id.into(),
            last_update,
            instance_ids,
        }
    }
}

/// Metadata of a study, used to resolve the owning patient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyMetadata {
    pub study_id: String,
    pub patient_id: String,
}
