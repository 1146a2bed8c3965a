//! In-memory source server
//!
//! Holds series, studies and instance payloads in process memory. Faults can
//! be injected per instance or per series to exercise retry and recovery
//! paths without a live server.

use crate::{InstanceSink, SourceClient, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use retire_core::{SeriesMetadata, StudyMetadata};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct SeriesEntry {
    study_id: String,
    last_update: DateTime<Utc>,
    instance_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    series: BTreeMap<String, SeriesEntry>,
    studies: HashMap<String, String>,
    instances: HashMap<String, Vec<u8>>,
    instance_faults: HashMap<String, usize>,
    instance_stalls: HashMap<String, Duration>,
    delete_faults: HashSet<String>,
    fetch_counts: HashMap<String, usize>,
    delete_calls: Vec<String>,
}

/// Source server backed by process memory
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<State>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series with its instance payloads
    ///
    /// The parent study is created (or re-pointed) at `patient_id`.
    pub fn add_series(
        &self,
        series_id: &str,
        study_id: &str,
        patient_id: &str,
        last_update: DateTime<Utc>,
        instances: Vec<(String, Vec<u8>)>,
    ) {
        let mut state = self.state.lock();
        let instance_ids = instances.iter().map(|(id, _)| id.clone()).collect();
        for (id, bytes) in instances {
            state.instances.insert(id, bytes);
        }
        state
            .studies
            .insert(study_id.to_string(), patient_id.to_string());
        state.series.insert(
            series_id.to_string(),
            SeriesEntry {
                study_id: study_id.to_string(),
                last_update,
                instance_ids,
            },
        );
    }

    /// Fail the next `times` fetches of an instance; `usize::MAX` fails forever
    pub fn fail_instance(&self, instance_id: &str, times: usize) {
        self.state
            .lock()
            .instance_faults
            .insert(instance_id.to_string(), times);
    }

    /// Make every fetch of an instance sleep before answering
    pub fn stall_instance(&self, instance_id: &str, delay: Duration) {
        self.state
            .lock()
            .instance_stalls
            .insert(instance_id.to_string(), delay);
    }

    /// Reject every delete of a series with a server error
    pub fn fail_delete(&self, series_id: &str) {
        self.state
            .lock()
            .delete_faults
            .insert(series_id.to_string());
    }

    pub fn contains_series(&self, series_id: &str) -> bool {
        self.state.lock().series.contains_key(series_id)
    }

    /// Number of fetch attempts seen for an instance, failed ones included
    pub fn fetch_count(&self, instance_id: &str) -> usize {
        self.state
            .lock()
            .fetch_counts
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Series ids passed to `delete_series`, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().delete_calls.clone()
    }

    /// Payload of a stored instance
    pub fn instance_bytes(&self, instance_id: &str) -> Option<Vec<u8>> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    /// Resolve an instance fetch: consume an injected fault or copy the payload
    fn take_instance(&self, instance_id: &str) -> Result<(Option<Duration>, Vec<u8>), SourceError> {
        let mut state = self.state.lock();
        *state
            .fetch_counts
            .entry(instance_id.to_string())
            .or_insert(0) += 1;

        if let Some(remaining) = state.instance_faults.get_mut(instance_id) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(SourceError::Transport {
                    resource: format!("/instances/{}/file", instance_id),
                    message: "injected fault".to_string(),
                });
            }
        }

        let stall = state.instance_stalls.get(instance_id).copied();
        let bytes = state
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("/instances/{}", instance_id)))?;
        Ok((stall, bytes))
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn list_series(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.state.lock().series.keys().cloned().collect())
    }

    async fn get_series_metadata(&self, series_id: &str) -> Result<SeriesMetadata, SourceError> {
        let state = self.state.lock();
        let entry = state
            .series
            .get(series_id)
            .ok_or_else(|| SourceError::NotFound(format!("/series/{}", series_id)))?;

        Ok(SeriesMetadata::new(
            series_id,
            entry.study_id.clone(),
            entry.last_update,
            entry.instance_ids.clone(),
        ))
    }

    async fn get_study_metadata(&self, study_id: &str) -> Result<StudyMetadata, SourceError> {
        let state = self.state.lock();
        let patient_id = state
            .studies
            .get(study_id)
            .ok_or_else(|| SourceError::NotFound(format!("/studies/{}", study_id)))?;

        Ok(StudyMetadata {
            study_id: study_id.to_string(),
            patient_id: patient_id.clone(),
        })
    }

    async fn fetch_instance(&self, instance_id: &str, sink: &mut InstanceSink) -> Result<u64, SourceError> {
        let (stall, bytes) = self.take_instance(instance_id)?;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        for chunk in bytes.chunks(CHUNK_SIZE) {
            sink.write_all(chunk).await.map_err(SourceError::Sink)?;
        }
        sink.flush().await.map_err(SourceError::Sink)?;
        Ok(bytes.len() as u64)
    }

    async fn delete_series(&self, series_id: &str) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        state.delete_calls.push(series_id.to_string());

        if state.delete_faults.contains(series_id) {
            return Err(SourceError::Server {
                status: 500,
                resource: format!("/series/{}", series_id),
            });
        }

        let entry = state
            .series
            .remove(series_id)
            .ok_or_else(|| SourceError::NotFound(format!("/series/{}", series_id)))?;
        for id in &entry.instance_ids {
            state.instances.remove(id);
        }
        Ok(())
    }
}
