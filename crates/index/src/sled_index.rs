//! Archive index stored in a sled tree
//!
//! One tree, `archived_series`, keyed by series id. Values are bincode
//! encoded `ArchiveRecord`s. Each mutation runs as a single-tree sled
//! transaction and the database is flushed before returning.

use crate::{ArchiveIndex, IndexError, RecordIter};
use chrono::{DateTime, Utc};
use retire_core::{ArchiveRecord, CommitInfo, RecordFilter, RecordStatus};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::path::Path;

const RECORDS_TREE: &str = "archived_series";

/// sled-backed archive index
pub struct SledIndex {
    db: Db,
    records: Tree,
}

impl SledIndex {
    /// Open or create an index at the given directory
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let db = sled::open(path)?;
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(Self { db, records })
    }

    /// Get the total number of records in any state
    pub fn count(&self) -> usize {
        self.records.len()
    }

    fn flush(&self) -> Result<(), IndexError> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode(record: &ArchiveRecord) -> Result<Vec<u8>, IndexError> {
    bincode::serialize(record).map_err(|e| IndexError::Corrupt {
        key: record.series_id.clone(),
        reason: e.to_string(),
    })
}

fn decode(key: &[u8], value: &[u8]) -> Result<ArchiveRecord, IndexError> {
    bincode::deserialize(value).map_err(|e| IndexError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

fn unwrap_tx<T>(result: Result<T, TransactionError<IndexError>>) -> Result<T, IndexError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(IndexError::Sled(e)),
    }
}

impl ArchiveIndex for SledIndex {
    fn begin_at(
        &self,
        series_id: &str,
        study_id: &str,
        patient_id: &str,
        begun_at: DateTime<Utc>,
    ) -> Result<ArchiveRecord, IndexError> {
        let record = ArchiveRecord::pending(series_id, study_id, patient_id, begun_at);
        let value = encode(&record)?;

        unwrap_tx(self.records.transaction(|tx| {
            if tx.get(series_id.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(IndexError::DuplicateSeries(
                    series_id.to_string(),
                )));
            }
            tx.insert(series_id.as_bytes(), value.clone())?;
            Ok(())
        }))?;

        self.flush()?;
        Ok(record)
    }

    fn commit(&self, series_id: &str, info: CommitInfo) -> Result<ArchiveRecord, IndexError> {
        let committed = unwrap_tx(self.records.transaction(|tx| {
            let current = match tx.get(series_id.as_bytes())? {
                Some(value) => decode(series_id.as_bytes(), &value)
                    .map_err(ConflictableTransactionError::Abort)?,
                None => {
                    return Err(ConflictableTransactionError::Abort(IndexError::RecordNotFound(
                        series_id.to_string(),
                    )))
                }
            };

            if current.status != RecordStatus::Pending {
                return Err(ConflictableTransactionError::Abort(IndexError::RecordNotFound(
                    series_id.to_string(),
                )));
            }

            let committed = current.committed(info.clone());
            let value = encode(&committed).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(series_id.as_bytes(), value)?;
            Ok(committed)
        }))?;

        self.flush()?;
        Ok(committed)
    }

    fn abort(&self, series_id: &str) -> Result<bool, IndexError> {
        let removed = unwrap_tx(self.records.transaction(|tx| {
            let current = match tx.get(series_id.as_bytes())? {
                Some(value) => decode(series_id.as_bytes(), &value)
                    .map_err(ConflictableTransactionError::Abort)?,
                None => return Ok(false),
            };

            if current.is_committed() {
                return Err(ConflictableTransactionError::Abort(IndexError::AlreadyCommitted(
                    series_id.to_string(),
                )));
            }

            tx.remove(series_id.as_bytes())?;
            Ok(true)
        }))?;

        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    fn find_pending(&self) -> Result<Vec<ArchiveRecord>, IndexError> {
        let mut pending = Vec::new();
        for item in self.records.iter() {
            let (key, value) = item?;
            let record = decode(&key, &value)?;
            if record.status == RecordStatus::Pending {
                pending.push(record);
            }
        }
        Ok(pending)
    }

    fn list_committed(&self, filter: RecordFilter) -> RecordIter<'_> {
        Box::new(self.records.iter().filter_map(move |item| {
            let record = item
                .map_err(IndexError::from)
                .and_then(|(key, value)| decode(&key, &value));
            match record {
                Ok(record) if filter.matches(&record) => Some(Ok(record)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }

    fn get(&self, series_id: &str) -> Result<Option<ArchiveRecord>, IndexError> {
        match self.records.get(series_id.as_bytes())? {
            Some(value) => Ok(Some(decode(series_id.as_bytes(), &value)?)),
            None => Ok(None),
        }
    }
}
