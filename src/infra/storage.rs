use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::{ErrorKind, Fields, NormalizedRecord, RecordKey, SourceIdentity, TimeWindow};
use crate::engine::persistence::{RecordSink, RunHistoryEntry, SinkError, UpsertKind};

impl From<rusqlite::Error> for SinkError {
    fn from(e: rusqlite::Error) -> Self {
        SinkError::Backend(e.to_string())
    }
}

/// SQLite-backed record store. One connection, serialized behind a mutex.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let db_path = db_path.as_ref();

        // Ensure directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::Backend(e.to_string()))?;
        }

        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, SinkError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SinkError> {
        // In-memory databases answer "memory" here, which is fine
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                source_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                fields TEXT NOT NULL,
                published_at TEXT,
                collected_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source_type, record_id)
             );
             CREATE INDEX IF NOT EXISTS idx_records_kind ON records(source_type, kind);

             CREATE TABLE IF NOT EXISTS collection_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                handle TEXT NOT NULL,
                window_start TEXT,
                window_end TEXT,
                success INTEGER NOT NULL,
                item_count INTEGER NOT NULL,
                error_kind TEXT,
                error_detail TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_history_run ON collection_history(run_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SinkError> {
        self.conn.lock().map_err(|_| SinkError::Poisoned)
    }

    pub fn get_record(&self, key: &RecordKey) -> Result<Option<NormalizedRecord>, SinkError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT kind, fields, published_at, collected_at
                 FROM records
                 WHERE source_type = ?1 AND record_id = ?2",
                params![key.source_type, key.record_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<DateTime<Utc>>>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(kind, fields, published_at, collected_at)| -> Result<NormalizedRecord, SinkError> {
            let fields: Fields = serde_json::from_str(&fields)?;
            let mut record = NormalizedRecord::new(key.source_type.clone(), key.record_id.clone(), kind)
                .with_fields(fields)
                .with_collected_at(collected_at);
            record.published_at = published_at;
            Ok(record)
        })
        .transpose()
    }

    pub fn count_records(&self, source_type: Option<&str>) -> Result<usize, SinkError> {
        let conn = self.conn()?;
        let count: i64 = match source_type {
            Some(source_type) => conn.query_row(
                "SELECT COUNT(*) FROM records WHERE source_type = ?1",
                params![source_type.to_lowercase()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    pub fn recent_history(&self, limit: usize) -> Result<Vec<RunHistoryEntry>, SinkError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, source_type, handle, window_start, window_end, success, item_count,
                    error_kind, error_detail, started_at, finished_at
             FROM collection_history
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let entries = stmt
            .query_map(params![limit as i64], Self::row_to_history)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<RunHistoryEntry> {
        let run_id: String = row.get(0)?;
        let window_start: Option<DateTime<Utc>> = row.get(3)?;
        let window_end: Option<DateTime<Utc>> = row.get(4)?;
        let error_kind: Option<String> = row.get(7)?;

        Ok(RunHistoryEntry {
            run_id: run_id.parse().unwrap_or_default(),
            identity: SourceIdentity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            time_window: window_start.zip(window_end).and_then(|(s, e)| TimeWindow::new(s, e)),
            success: row.get(5)?,
            item_count: row.get::<_, i64>(6)? as usize,
            error_kind: error_kind
                .and_then(|k| serde_json::from_value::<ErrorKind>(serde_json::Value::String(k)).ok()),
            error_detail: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }
}

impl RecordSink for SqliteSink {
    fn current_fields(&self, key: &RecordKey) -> Result<Option<Fields>, SinkError> {
        let conn = self.conn()?;
        let fields: Option<String> = conn
            .query_row(
                "SELECT fields FROM records WHERE source_type = ?1 AND record_id = ?2",
                params![key.source_type, key.record_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(fields.map(|f| serde_json::from_str(&f)).transpose()?)
    }

    fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertKind, SinkError> {
        let fields = serde_json::to_string(&record.fields)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existed = tx
            .query_row(
                "SELECT 1 FROM records WHERE source_type = ?1 AND record_id = ?2",
                params![record.source_type, record.record_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO records (source_type, record_id, kind, fields, published_at, collected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_type, record_id) DO UPDATE SET
                kind = excluded.kind,
                fields = excluded.fields,
                published_at = excluded.published_at,
                collected_at = excluded.collected_at,
                updated_at = excluded.updated_at",
            params![
                record.source_type,
                record.record_id,
                record.kind,
                fields,
                record.published_at,
                record.collected_at,
                Utc::now(),
            ],
        )?;
        tx.commit()?;

        Ok(if existed {
            UpsertKind::Updated
        } else {
            UpsertKind::Created
        })
    }

    fn record_run(&self, entry: &RunHistoryEntry) -> Result<(), SinkError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO collection_history
                (run_id, source_type, handle, window_start, window_end, success, item_count,
                 error_kind, error_detail, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.run_id.to_string(),
                entry.identity.source_type,
                entry.identity.handle,
                entry.time_window.map(|w| w.start()),
                entry.time_window.map(|w| w.end()),
                entry.success,
                entry.item_count as i64,
                entry.error_kind.map(|k| k.to_string()),
                entry.error_detail,
                entry.started_at,
                entry.finished_at,
            ],
        )?;
        Ok(())
    }

    fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize, SinkError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM collection_history WHERE finished_at < ?1",
            params![cutoff],
        )?)
    }
}
