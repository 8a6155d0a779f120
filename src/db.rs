// src/db.rs
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::collaborators::{CachedBlob, KvCache, OfflineQueue};
use crate::finish::FinishPayload;
use crate::offline::{JobStatus, OfflineJob, DEFAULT_MAX_ATTEMPTS};

// Custom Error type for DB operations
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection failed")]
    Connection(#[from] rusqlite::Error),
    #[error("Failed to get application data directory")]
    DataDir,
    #[error("I/O error accessing database file")]
    Io(#[from] std::io::Error),
    #[error("Offline job not found: ID {0}")]
    JobNotFound(String),
    #[error("Database query failed: {0}")]
    QueryFailed(rusqlite::Error),
    #[error("Database write failed: {0}")]
    WriteFailed(rusqlite::Error),
    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

const DB_FILE_NAME: &str = "session.sqlite";
const APP_DATA_DIR: &str = "active-session";

/// Gets the path to the SQLite database file within the app's data directory.
/// Creates the directory if it doesn't exist.
pub fn get_db_path() -> Result<PathBuf, DbError> {
    let data_dir = dirs::data_dir().ok_or(DbError::DataDir)?;
    let app_dir = data_dir.join(APP_DATA_DIR);
    if !app_dir.exists() {
        std::fs::create_dir_all(&app_dir)?;
    }
    Ok(app_dir.join(DB_FILE_NAME))
}

/// Opens a connection to the SQLite database.
pub fn open_db<P: AsRef<Path>>(path: P) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::Connection)
}

/// Initializes the database tables if they don't exist.
pub fn init_db(conn: &Connection) -> Result<(), DbError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_cache (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,               -- JSON blob
            written_at TEXT NOT NULL           -- RFC3339
        )",
        [],
    )
    .map_err(DbError::Connection)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS offline_queue (
            id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL,
            details TEXT NOT NULL,
            payload TEXT NOT NULL,             -- Serialized finish payload
            status TEXT NOT NULL CHECK(status IN ('pending', 'processing', 'failed', 'done')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at TEXT,              -- NULL means due immediately
            last_error TEXT
        )",
        [],
    )
    .map_err(DbError::Connection)?;

    Ok(())
}

pub fn kv_get(conn: &Connection, key: &str) -> Result<Option<CachedBlob>, DbError> {
    conn.query_row(
        "SELECT value, written_at FROM kv_cache WHERE key = ?1",
        params![key],
        |row| {
            Ok(CachedBlob {
                value: row.get(0)?,
                written_at: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(DbError::QueryFailed)
}

pub fn kv_set(conn: &Connection, key: &str, value: &str, written_at: DateTime<Utc>) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO kv_cache (key, value, written_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, written_at = excluded.written_at",
        params![key, value, written_at],
    )
    .map_err(DbError::WriteFailed)?;
    Ok(())
}

/// Inserts or replaces a queued job.
pub fn queue_put(conn: &Connection, job: &OfflineJob) -> Result<(), DbError> {
    conn.execute(
        "INSERT OR REPLACE INTO offline_queue
            (id, kind, created_at, details, payload, status, attempts, max_attempts, next_attempt_at, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            job.id,
            job.kind,
            job.created_at,
            job.details,
            job.payload,
            job.status.to_string(),
            job.attempts,
            job.max_attempts,
            job.next_attempt_at,
            job.last_error,
        ],
    )
    .map_err(DbError::WriteFailed)?;
    Ok(())
}

// Helper function to map a database row to an OfflineJob struct
fn map_row_to_job(row: &Row) -> Result<OfflineJob, rusqlite::Error> {
    let status_str: String = row.get(5)?;
    let status = JobStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(OfflineJob {
        id: row.get(0)?,
        kind: row.get(1)?,
        created_at: row.get(2)?,
        details: row.get(3)?,
        payload: row.get(4)?,
        status,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        next_attempt_at: row.get(8)?,
        last_error: row.get(9)?,
    })
}

const JOB_COLUMNS: &str =
    "id, kind, created_at, details, payload, status, attempts, max_attempts, next_attempt_at, last_error";

/// All queued jobs, oldest first.
pub fn queue_get_all(conn: &Connection) -> Result<Vec<OfflineJob>, DbError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM offline_queue ORDER BY created_at ASC, id ASC");
    let mut stmt = conn.prepare(&sql).map_err(DbError::QueryFailed)?;
    let jobs = stmt
        .query_map([], map_row_to_job)
        .map_err(DbError::QueryFailed)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(DbError::QueryFailed)?;
    Ok(jobs)
}

pub fn queue_get(conn: &Connection, id: &str) -> Result<Option<OfflineJob>, DbError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM offline_queue WHERE id = ?1");
    conn.query_row(&sql, params![id], map_row_to_job)
        .optional()
        .map_err(DbError::QueryFailed)
}

/// Deletes a job. Returns the number of rows removed (0 or 1).
pub fn queue_delete(conn: &Connection, id: &str) -> Result<usize, DbError> {
    conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])
        .map_err(DbError::WriteFailed)
}

pub fn queue_clear(conn: &Connection) -> Result<usize, DbError> {
    conn.execute("DELETE FROM offline_queue", [])
        .map_err(DbError::WriteFailed)
}

/// SQLite-backed local store: the key-value cache and the offline queue.
pub struct LocalStore {
    conn: Connection,
    max_attempts: u32,
}

impl LocalStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = open_db(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// A throwaway store, used by tests and dry runs.
    pub fn in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Attempt budget given to newly queued jobs.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn jobs(&self) -> Result<Vec<OfflineJob>, DbError> {
        queue_get_all(&self.conn)
    }

    pub fn job(&self, id: &str) -> Result<Option<OfflineJob>, DbError> {
        queue_get(&self.conn, id)
    }

    pub fn put_job(&self, job: &OfflineJob) -> Result<(), DbError> {
        queue_put(&self.conn, job)
    }

    pub fn delete_job(&self, id: &str) -> Result<bool, DbError> {
        Ok(queue_delete(&self.conn, id)? > 0)
    }

    pub fn clear_jobs(&self) -> Result<usize, DbError> {
        queue_clear(&self.conn)
    }
}

impl KvCache for LocalStore {
    fn read(&self, key: &str) -> Option<CachedBlob> {
        match kv_get(&self.conn, key) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Cache read of '{}' failed: {}", key, e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str, written_at: DateTime<Utc>) {
        if let Err(e) = kv_set(&self.conn, key, value, written_at) {
            warn!("Cache write of '{}' failed: {}", key, e);
        }
    }
}

impl OfflineQueue for LocalStore {
    fn enqueue(&self, payload: &FinishPayload) -> Result<String, DbError> {
        let job = OfflineJob::finish_workout(payload, Utc::now(), self.max_attempts)?;
        self.put_job(&job)?;
        debug!("Queued offline job {}", job.id);
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_overwrites_and_reads_back() {
        let store = LocalStore::in_memory().unwrap();
        assert!(store.read("missing").is_none());
        let t1 = Utc::now();
        store.write("k", "{\"a\":1}", t1);
        store.write("k", "{\"a\":2}", t1);
        let blob = store.read("k").unwrap();
        assert_eq!(blob.value, "{\"a\":2}");
        assert_eq!(blob.written_at.timestamp(), t1.timestamp());
    }

    #[test]
    fn queue_put_get_delete() {
        let store = LocalStore::in_memory().unwrap();
        let mut job = OfflineJob {
            id: "finish_1".into(),
            kind: "finish_workout".into(),
            created_at: Utc::now(),
            details: "Push".into(),
            payload: "{}".into(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 10,
            next_attempt_at: None,
            last_error: None,
        };
        store.put_job(&job).unwrap();
        job.status = JobStatus::Failed;
        job.attempts = 3;
        store.put_job(&job).unwrap();
        let loaded = store.job("finish_1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.attempts, 3);
        assert_eq!(store.jobs().unwrap().len(), 1);
        assert!(store.delete_job("finish_1").unwrap());
        assert!(!store.delete_job("finish_1").unwrap());
    }
}
