use std::path::PathBuf;

use chrono::{Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use vigil_core::{ActivityLabel, ActivityRecord, HistoryStore, VigilError};

/// A persisted record plus its row metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: i64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub record: ActivityRecord,
}

/// SQLite-backed activity history.
///
/// A connection is opened per operation so the store can be shared freely
/// between the engine's coordinator thread and the console.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, String> {
        Connection::open(&self.db_path).map_err(|e| e.to_string())
    }

    fn init_schema(&self) -> Result<(), String> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS activity_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              label TEXT NOT NULL,
              started_at_ns INTEGER NOT NULL,
              ended_at_ns INTEGER NOT NULL,
              sample_count INTEGER NOT NULL DEFAULT 0,
              recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_started_at ON activity_records(started_at_ns);
            "#,
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn insert(&self, record: &ActivityRecord) -> Result<i64, String> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO activity_records
            (label, started_at_ns, ended_at_ns, sample_count, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.label.as_str(),
                to_sql_ns(record.started_at),
                to_sql_ns(record.ended_at),
                to_sql_ns(record.sample_count),
                Utc::now().timestamp()
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(conn.last_insert_rowid())
    }

    /// Records overlapping `[from, to)`, oldest first.
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<StoredRecord>, String> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, label, started_at_ns, ended_at_ns, sample_count, recorded_at
                 FROM activity_records
                 WHERE started_at_ns < ?1 AND ended_at_ns >= ?2
                 ORDER BY started_at_ns ASC, id ASC",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![to_sql_ns(to), to_sql_ns(from)], stored_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    pub fn latest(&self) -> Result<Option<StoredRecord>, String> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT id, label, started_at_ns, ended_at_ns, sample_count, recorded_at
             FROM activity_records ORDER BY started_at_ns DESC, id DESC LIMIT 1",
            [],
            stored_from_row,
        )
        .optional()
        .map_err(|e| e.to_string())
    }

    pub fn count(&self) -> Result<usize, String> {
        let conn = self.open()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM activity_records", [], |row| row.get(0))
            .map_err(|e| e.to_string())?;
        Ok(n.max(0) as usize)
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: i64) -> Result<bool, String> {
        let conn = self.open()?;
        let changed = conn
            .execute("DELETE FROM activity_records WHERE id = ?1", params![id])
            .map_err(|e| e.to_string())?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> Result<usize, String> {
        let conn = self.open()?;
        conn.execute("DELETE FROM activity_records", [])
            .map_err(|e| e.to_string())
    }

    /// Delete records that ended more than `retention_days` ago.
    pub fn prune(&self, retention_days: usize) -> Result<usize, String> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let cutoff_ns = cutoff.timestamp_nanos_opt().unwrap_or(0);
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM activity_records WHERE ended_at_ns < ?1",
            params![cutoff_ns],
        )
        .map_err(|e| e.to_string())
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, record: &ActivityRecord) -> vigil_core::Result<()> {
        self.insert(record).map(|_| ()).map_err(VigilError::SinkWrite)
    }

    fn query(&self, from: u64, to: u64) -> vigil_core::Result<Vec<ActivityRecord>> {
        self.range(from, to)
            .map(|rows| rows.into_iter().map(|r| r.record).collect())
            .map_err(VigilError::SinkRead)
    }

    fn last(&self) -> vigil_core::Result<Option<ActivityRecord>> {
        self.latest()
            .map(|row| row.map(|r| r.record))
            .map_err(VigilError::SinkRead)
    }
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let label: String = row.get(1)?;
    let recorded_at: i64 = row.get(5)?;
    Ok(StoredRecord {
        id: row.get(0)?,
        recorded_at: ts_to_rfc3339(recorded_at),
        record: ActivityRecord {
            label: ActivityLabel::new(label),
            started_at: from_sql_ns(row.get(2)?),
            ended_at: from_sql_ns(row.get(3)?),
            sample_count: from_sql_ns(row.get(4)?),
        },
    })
}

// SQLite integers are signed; nanosecond timestamps fit until 2262.
fn to_sql_ns(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_ns(value: i64) -> u64 {
    value.max(0) as u64
}

fn ts_to_rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
