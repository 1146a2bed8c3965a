//! Archive index stored in a single SQLite file
//!
//! Uses the `archived_series` table. Mutations run inside `BEGIN IMMEDIATE`
//! transactions so concurrent readers never observe a half-applied change.
//! Timestamps are stored as Unix milliseconds.

use crate::{ArchiveIndex, IndexError, RecordIter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use retire_core::{ArchiveRecord, CommitInfo, RecordFilter, RecordStatus};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS archived_series (
        series_id        TEXT PRIMARY KEY,
        study_id         TEXT NOT NULL,
        patient_id       TEXT NOT NULL,
        status           TEXT NOT NULL CHECK (status IN ('PENDING', 'COMMITTED')),
        begun_at_ms      INTEGER NOT NULL,
        archived_at_ms   INTEGER,
        container_path   TEXT,
        instance_count   INTEGER NOT NULL DEFAULT 0,
        container_bytes  INTEGER NOT NULL DEFAULT 0,
        container_blake3 TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_archived_series_status ON archived_series(status);
    CREATE INDEX IF NOT EXISTS idx_archived_series_patient ON archived_series(patient_id);
";

const COLUMNS: &str = "series_id, study_id, patient_id, status, begun_at_ms, archived_at_ms, \
     container_path, instance_count, container_bytes, container_blake3";

/// Rows fetched per page by `list_committed`
const PAGE_SIZE: i64 = 256;

/// SQLite-backed archive index
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Open or create an index database file
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, IndexError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn select_one(conn: &Connection, series_id: &str) -> Result<Option<ArchiveRecord>, IndexError> {
        let sql = format!("SELECT {} FROM archived_series WHERE series_id = ?1", COLUMNS);
        Ok(conn
            .query_row(&sql, params![series_id], read_record)
            .optional()?)
    }

    fn committed_page(
        &self,
        filter: &RecordFilter,
        after: Option<&str>,
    ) -> Result<Vec<ArchiveRecord>, IndexError> {
        let sql = format!(
            "SELECT {} FROM archived_series
             WHERE status = 'COMMITTED'
               AND (?1 IS NULL OR series_id > ?1)
               AND (?2 IS NULL OR patient_id = ?2)
               AND (?3 IS NULL OR study_id = ?3)
               AND (?4 IS NULL OR archived_at_ms >= ?4)
               AND (?5 IS NULL OR archived_at_ms < ?5)
             ORDER BY series_id
             LIMIT ?6",
            COLUMNS
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                after,
                filter.patient_id,
                filter.study_id,
                filter.archived_after.map(|t| t.timestamp_millis()),
                filter.archived_before.map(|t| t.timestamp_millis()),
                PAGE_SIZE,
            ],
            read_record,
        )?;

        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }
}

fn to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, format!("timestamp out of range: {}", ms).into())
    })
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<ArchiveRecord> {
    let status: String = row.get(3)?;
    let status = RecordStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("unknown status {}", status).into())
    })?;

    let archived_at = match row.get::<_, Option<i64>>(5)? {
        Some(ms) => Some(to_datetime(5, ms)?),
        None => None,
    };

    Ok(ArchiveRecord {
        series_id: row.get(0)?,
        study_id: row.get(1)?,
        patient_id: row.get(2)?,
        status,
        begun_at: to_datetime(4, row.get(4)?)?,
        archived_at,
        container_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        instance_count: row.get(7)?,
        container_bytes: row.get::<_, i64>(8)? as u64,
        container_blake3: row.get(9)?,
    })
}

impl ArchiveIndex for SqliteIndex {
    fn begin_at(
        &self,
        series_id: &str,
        study_id: &str,
        patient_id: &str,
        begun_at: DateTime<Utc>,
    ) -> Result<ArchiveRecord, IndexError> {
        let record = ArchiveRecord::pending(series_id, study_id, patient_id, begun_at);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM archived_series WHERE series_id = ?1)",
            params![series_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(IndexError::DuplicateSeries(series_id.to_string()));
        }

        tx.execute(
            "INSERT INTO archived_series (series_id, study_id, patient_id, status, begun_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                series_id,
                study_id,
                patient_id,
                RecordStatus::Pending.as_str(),
                begun_at.timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(record)
    }

    fn commit(&self, series_id: &str, info: CommitInfo) -> Result<ArchiveRecord, IndexError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE archived_series
             SET status = ?2, archived_at_ms = ?3, container_path = ?4,
                 instance_count = ?5, container_bytes = ?6, container_blake3 = ?7
             WHERE series_id = ?1 AND status = ?8",
            params![
                series_id,
                RecordStatus::Committed.as_str(),
                info.archived_at.timestamp_millis(),
                info.container_path.to_string_lossy().into_owned(),
                info.instance_count,
                info.container_bytes as i64,
                info.container_blake3,
                RecordStatus::Pending.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(IndexError::RecordNotFound(series_id.to_string()));
        }

        let record = Self::select_one(&tx, series_id)?
            .ok_or_else(|| IndexError::RecordNotFound(series_id.to_string()))?;
        tx.commit()?;

        Ok(record)
    }

    fn abort(&self, series_id: &str) -> Result<bool, IndexError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM archived_series WHERE series_id = ?1",
                params![series_id],
                |row| row.get(0),
            )
            .optional()?;

        match status.as_deref().map(RecordStatus::parse) {
            None => Ok(false),
            Some(Some(RecordStatus::Committed)) => {
                Err(IndexError::AlreadyCommitted(series_id.to_string()))
            }
            Some(Some(RecordStatus::Pending)) => {
                tx.execute(
                    "DELETE FROM archived_series WHERE series_id = ?1 AND status = ?2",
                    params![series_id, RecordStatus::Pending.as_str()],
                )?;
                tx.commit()?;
                Ok(true)
            }
            Some(None) => Err(IndexError::Corrupt {
                key: series_id.to_string(),
                reason: format!("unknown status {:?}", status),
            }),
        }
    }

    fn find_pending(&self) -> Result<Vec<ArchiveRecord>, IndexError> {
        let sql = format!(
            "SELECT {} FROM archived_series WHERE status = ?1 ORDER BY series_id",
            COLUMNS
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![RecordStatus::Pending.as_str()], read_record)?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    fn list_committed(&self, filter: RecordFilter) -> RecordIter<'_> {
        Box::new(CommittedPages {
            index: self,
            filter,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn get(&self, series_id: &str) -> Result<Option<ArchiveRecord>, IndexError> {
        let conn = self.conn.lock();
        Self::select_one(&conn, series_id)
    }
}

/// Keyset-paginated iterator; holds the connection lock only while a page loads
struct CommittedPages<'a> {
    index: &'a SqliteIndex,
    filter: RecordFilter,
    last_key: Option<String>,
    buffer: VecDeque<ArchiveRecord>,
    exhausted: bool,
}

impl Iterator for CommittedPages<'_> {
    type Item = Result<ArchiveRecord, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.index.committed_page(&self.filter, self.last_key.as_deref()) {
                Ok(page) => {
                    if (page.len() as i64) < PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.last_key = Some(last.series_id.clone());
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        self.buffer.pop_front().map(Ok)
    }
}
