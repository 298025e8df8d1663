//! SQLite store: WAL-mode database holding the `batch_log` table.
//!
//! One writer connection behind a mutex (the drain worker is the only steady
//! writer) and a small pool of read-only connections so poll workers and
//! one-shot queries do not serialize behind inserts. Timestamps are stored as
//! integer microseconds since the epoch so range predicates and ordering stay
//! numeric.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row, params};

use super::{LevelCount, LogStore, SortOrder};
use crate::core::errors::{BlsError, Result};
use crate::ingest::record::{EventRecord, LogLevel};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
const MAX_IDLE_READERS: usize = 4;

macro_rules! select_records {
    ($tail:literal) => {
        concat!(
            "SELECT id, execution_id, job_name, step_name, log_level, message,
                    logger_name, thread_name, error_trace, log_time_us, persisted_at_us
             FROM batch_log ",
            $tail
        )
    };
}

/// SQLite-backed [`LogStore`].
pub struct SqliteLogStore {
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl SqliteLogStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| BlsError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the writer connection is in WAL mode.
    pub fn is_wal_mode(&self) -> bool {
        self.writer
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let idle = self.readers.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => open_reader(&self.path)?,
        };
        let out = f(&conn);
        let mut pool = self.readers.lock();
        if pool.len() < MAX_IDLE_READERS {
            pool.push(conn);
        }
        out
    }

    fn fetch<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<EventRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params, row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl LogStore for SqliteLogStore {
    fn insert(&self, record: &EventRecord) -> Result<i64> {
        let persisted_at_us = Utc::now().timestamp_micros();
        let conn = self.writer.lock();
        conn.prepare_cached(
            "INSERT INTO batch_log (
                execution_id, job_name, step_name, log_level, message,
                logger_name, thread_name, error_trace, log_time_us, persisted_at_us
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        )?
        .execute(params![
            record.execution_id,
            record.job_name,
            record.step_name,
            record.level.as_str(),
            record.message,
            record.logger_name,
            record.thread_name,
            record.error_trace,
            record.timestamp.timestamp_micros(),
            persisted_at_us,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    fn query_by_execution_id(
        &self,
        execution_id: &str,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>> {
        match order {
            SortOrder::Ascending => self.fetch(
                select_records!("WHERE execution_id = ?1 ORDER BY log_time_us ASC, id ASC"),
                params![execution_id],
            ),
            SortOrder::Descending => self.fetch(
                select_records!("WHERE execution_id = ?1 ORDER BY log_time_us DESC, id DESC"),
                params![execution_id],
            ),
        }
    }

    fn query_by_job_name(&self, job_name: &str) -> Result<Vec<EventRecord>> {
        self.fetch(
            select_records!("WHERE job_name = ?1 ORDER BY log_time_us DESC, id DESC"),
            params![job_name],
        )
    }

    fn query_by_level(&self, level: LogLevel) -> Result<Vec<EventRecord>> {
        self.fetch(
            select_records!("WHERE log_level = ?1 ORDER BY log_time_us DESC, id DESC"),
            params![level.as_str()],
        )
    }

    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        self.fetch(
            select_records!(
                "WHERE log_time_us BETWEEN ?1 AND ?2 ORDER BY log_time_us DESC, id DESC"
            ),
            params![start.timestamp_micros(), end.timestamp_micros()],
        )
    }

    fn query_recent(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.fetch(
            select_records!("ORDER BY log_time_us DESC, id DESC LIMIT ?1"),
            params![limit],
        )
    }

    fn query_by_time_after(&self, after: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        self.fetch(
            select_records!("WHERE log_time_us > ?1 ORDER BY log_time_us DESC, id DESC"),
            params![after.timestamp_micros()],
        )
    }

    fn query_errors(&self, execution_id: &str) -> Result<Vec<EventRecord>> {
        self.fetch(
            select_records!(
                "WHERE execution_id = ?1 AND log_level IN ('WARN', 'ERROR')
                 ORDER BY log_time_us ASC, id ASC"
            ),
            params![execution_id],
        )
    }

    fn level_counts(&self, execution_id: &str) -> Result<Vec<LevelCount>> {
        let raw: Vec<(String, i64)> = self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT log_level, COUNT(*) FROM batch_log
                 WHERE execution_id = ?1 GROUP BY log_level",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut counts = Vec::with_capacity(raw.len());
        for (level, count) in raw {
            let level = level.parse::<LogLevel>().map_err(|e| BlsError::Sql {
                context: "level_counts",
                details: e.to_string(),
            })?;
            counts.push(LevelCount {
                level,
                count: u64::try_from(count).unwrap_or(0),
            });
        }
        counts.sort_by_key(|c| c.level);
        Ok(counts)
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.writer.lock().execute(
            "DELETE FROM batch_log WHERE log_time_us < ?1",
            params![cutoff.timestamp_micros()],
        )?;
        Ok(deleted)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let level: String = row.get(4)?;
    let level = level.parse::<LogLevel>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(EventRecord {
        id: Some(row.get(0)?),
        execution_id: row.get(1)?,
        job_name: row.get(2)?,
        step_name: row.get(3)?,
        level,
        message: row.get(5)?,
        logger_name: row.get(6)?,
        thread_name: row.get(7)?,
        error_trace: row.get(8)?,
        timestamp: micros_column(row, 9)?,
        persisted_at: Some(micros_column(row, 10)?),
    })
}

fn micros_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;

    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "sqlite did not enter WAL mode");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS batch_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            job_name TEXT,
            step_name TEXT,
            log_level TEXT NOT NULL,
            message TEXT NOT NULL,
            logger_name TEXT NOT NULL,
            thread_name TEXT NOT NULL,
            error_trace TEXT,
            log_time_us INTEGER NOT NULL,
            persisted_at_us INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_batch_log_execution ON batch_log(execution_id);
        CREATE INDEX IF NOT EXISTS idx_batch_log_time ON batch_log(log_time_us);
        CREATE INDEX IF NOT EXISTS idx_batch_log_level ON batch_log(log_level);
        CREATE INDEX IF NOT EXISTS idx_batch_log_job_time
            ON batch_log(job_name, log_time_us);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::record::{EventContext, LogEvent};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn temp_db() -> (tempfile::TempDir, SqliteLogStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteLogStore::open(&db_path).unwrap();
        (dir, store)
    }

    fn record_at(exec: &str, job: &str, level: LogLevel, secs: i64) -> EventRecord {
        EventRecord {
            id: None,
            execution_id: exec.to_string(),
            job_name: Some(job.to_string()),
            step_name: Some("step1".to_string()),
            level,
            message: format!("{level} line {secs}"),
            logger_name: "com.acme.Tasklet".to_string(),
            thread_name: "worker-1".to_string(),
            error_trace: None,
            timestamp: Utc.timestamp_opt(1_750_000_000 + secs, 123_456_000).unwrap(),
            persisted_at: None,
        }
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, store) = temp_db();
        assert!(store.is_wal_mode());
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let (_dir, store) = temp_db();
        let ctx = EventContext::new("202501011200JOBX", "JOBX").with_step("load");
        let original = EventRecord::capture(
            &ctx,
            LogEvent::new(LogLevel::Error, "com.acme.Loader", "load failed")
                .with_thread_name("batch-7")
                .with_error(&std::io::Error::other("disk gone")),
        )
        .unwrap();

        let id = store.insert(&original).unwrap();
        let rows = store
            .query_by_execution_id("202501011200JOBX", SortOrder::Descending)
            .unwrap();
        assert_eq!(rows.len(), 1);
        let stored = &rows[0];
        assert_eq!(stored.id, Some(id));
        assert!(stored.persisted_at.is_some());

        let mut expected = original;
        expected.id = stored.id;
        expected.persisted_at = stored.persisted_at;
        assert_eq!(stored, &expected);
    }

    #[test]
    fn execution_id_order_is_selectable() {
        let (_dir, store) = temp_db();
        for secs in [2, 0, 1] {
            store
                .insert(&record_at("202501011200JOBX", "JOBX", LogLevel::Info, secs))
                .unwrap();
        }
        let asc = store
            .query_by_execution_id("202501011200JOBX", SortOrder::Ascending)
            .unwrap();
        let desc = store
            .query_by_execution_id("202501011200JOBX", SortOrder::Descending)
            .unwrap();
        assert!(asc.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(desc.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn job_level_time_queries() {
        let (_dir, store) = temp_db();
        store
            .insert(&record_at("202501011200JOBX", "JOBX", LogLevel::Info, 0))
            .unwrap();
        store
            .insert(&record_at("202501011300JOBX", "JOBX", LogLevel::Error, 10))
            .unwrap();
        store
            .insert(&record_at("202501011200JOBY", "JOBY", LogLevel::Error, 20))
            .unwrap();

        let jobx = store.query_by_job_name("JOBX").unwrap();
        assert_eq!(jobx.len(), 2);
        assert_eq!(jobx[0].execution_id, "202501011300JOBX");

        assert_eq!(store.query_by_level(LogLevel::Error).unwrap().len(), 2);

        let base = Utc.timestamp_opt(1_750_000_000, 0).unwrap();
        let range = store
            .query_by_time_range(base, base + ChronoDuration::seconds(11))
            .unwrap();
        assert_eq!(range.len(), 2);

        let after = store
            .query_by_time_after(record_at("x", "x", LogLevel::Info, 10).timestamp)
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].job_name.as_deref(), Some("JOBY"));

        assert_eq!(store.query_recent(1).unwrap()[0].job_name.as_deref(), Some("JOBY"));
    }

    #[test]
    fn errors_counts_and_prune() {
        let (_dir, store) = temp_db();
        let exec = "202501011200JOBX";
        store.insert(&record_at(exec, "JOBX", LogLevel::Info, 0)).unwrap();
        store.insert(&record_at(exec, "JOBX", LogLevel::Error, 1)).unwrap();
        store.insert(&record_at(exec, "JOBX", LogLevel::Warn, 2)).unwrap();
        store.insert(&record_at(exec, "JOBX", LogLevel::Warn, 3)).unwrap();

        let errors = store.query_errors(exec).unwrap();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].level, LogLevel::Error);

        let counts = store.level_counts(exec).unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(
            counts[2],
            LevelCount {
                level: LogLevel::Error,
                count: 1
            }
        );
        assert_eq!(counts[1].count, 2);

        let cutoff = record_at(exec, "JOBX", LogLevel::Info, 2).timestamp;
        assert_eq!(store.prune_before(cutoff).unwrap(), 2);
        assert_eq!(
            store
                .query_by_execution_id(exec, SortOrder::Ascending)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn rapid_inserts_no_data_loss() {
        let (_dir, store) = temp_db();
        for i in 0..1000 {
            store
                .insert(&record_at("202501011200JOBX", "JOBX", LogLevel::Debug, i))
                .unwrap();
        }
        assert_eq!(store.query_by_job_name("JOBX").unwrap().len(), 1000);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let (_dir, store) = temp_db();
        let store = std::sync::Arc::new(store);
        std::thread::scope(|s| {
            let writer = std::sync::Arc::clone(&store);
            s.spawn(move || {
                for i in 0..200 {
                    writer
                        .insert(&record_at("202501011200JOBX", "JOBX", LogLevel::Info, i))
                        .unwrap();
                }
            });
            for _ in 0..3 {
                let reader = std::sync::Arc::clone(&store);
                s.spawn(move || {
                    for _ in 0..50 {
                        reader.query_recent(10).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.query_by_job_name("JOBX").unwrap().len(), 200);
    }

    #[test]
    fn idempotent_schema_creation() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("idempotent.db");
        let _ = SqliteLogStore::open(&db_path).unwrap();
        let store = SqliteLogStore::open(&db_path).unwrap();
        assert!(store.is_wal_mode());
    }
}
