//! SQLite-backed run metadata and upload index.
//!
//! The event log stays the source of truth for what a run did; this store
//! keeps the queryable summary (status, timestamps, inputs) plus the list of
//! uploaded files. All calls hop onto the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{FileRef, RunInputs, RunRecord, RunStatus};
use crate::error::{EngineError, Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    inputs      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT,
    error       TEXT
);
CREATE INDEX IF NOT EXISTS runs_status ON runs(status);
CREATE TABLE IF NOT EXISTS uploads (
    id            TEXT PRIMARY KEY,
    path          TEXT NOT NULL,
    original_name TEXT NOT NULL,
    mime          TEXT NOT NULL,
    size          INTEGER NOT NULL,
    sha256        TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
";

const RUN_COLUMNS: &str = "id, status, inputs, created_at, started_at, finished_at, error";

/// Persistent run and upload metadata
#[derive(Clone)]
pub struct RunStore {
    conn: Arc<Mutex<Connection>>,
}

impl RunStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests and throwaway engines
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("run store task failed: {}", e)))?
    }

    /// Insert a newly created run
    pub async fn insert_run(&self, record: &RunRecord) -> Result<()> {
        let inputs = serde_json::to_string(&record.inputs).map_err(StorageError::from)?;
        let record = record.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, status, inputs, created_at, started_at, finished_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    record.status.as_str(),
                    inputs,
                    format_time(record.created_at),
                    record.started_at.map(format_time),
                    record.finished_at.map(format_time),
                    record.error,
                ],
            )
            .map_err(StorageError::from)?;
            debug!(run_id = %record.id, "Run inserted");
            Ok(())
        })
        .await
    }

    /// Persist a run's status, timestamps and failure message
    pub async fn update_status(&self, record: &RunRecord) -> Result<()> {
        let record = record.clone();

        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE runs SET status = ?2, started_at = ?3, finished_at = ?4, error = ?5
                     WHERE id = ?1",
                    params![
                        record.id.to_string(),
                        record.status.as_str(),
                        record.started_at.map(format_time),
                        record.finished_at.map(format_time),
                        record.error,
                    ],
                )
                .map_err(StorageError::from)?;

            if changed == 0 {
                return Err(EngineError::RunNotFound(record.id));
            }
            Ok(())
        })
        .await
    }

    /// Look up a run
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
            let raw = conn
                .query_row(&sql, params![run_id.to_string()], RawRun::from_row)
                .optional()
                .map_err(StorageError::from)?;
            raw.map(RawRun::into_record).transpose()
        })
        .await
    }

    /// Most recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM runs ORDER BY created_at DESC LIMIT ?1",
                RUN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
            let rows = stmt
                .query_map(params![limit as i64], RawRun::from_row)
                .map_err(StorageError::from)?;

            let mut records = Vec::new();
            for raw in rows {
                records.push(raw.map_err(StorageError::from)?.into_record()?);
            }
            Ok(records)
        })
        .await
    }

    /// Runs currently in any of the given statuses, oldest first
    pub async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<RunRecord>> {
        let wanted: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();

        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM runs ORDER BY created_at ASC", RUN_COLUMNS);
            let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
            let rows = stmt
                .query_map([], RawRun::from_row)
                .map_err(StorageError::from)?;

            let mut records = Vec::new();
            for raw in rows {
                let raw = raw.map_err(StorageError::from)?;
                if wanted.contains(&raw.status.as_str()) {
                    records.push(raw.into_record()?);
                }
            }
            Ok(records)
        })
        .await
    }

    /// Record an uploaded file
    pub async fn save_upload(&self, file: &FileRef) -> Result<()> {
        let file = file.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO uploads (id, path, original_name, mime, size, sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file.id,
                    file.path.to_string_lossy(),
                    file.original_name,
                    file.mime,
                    file.size as i64,
                    file.sha256,
                    format_time(file.created_at),
                ],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    /// All uploads, newest first
    pub async fn list_uploads(&self) -> Result<Vec<FileRef>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, path, original_name, mime, size, sha256, created_at
                     FROM uploads ORDER BY created_at DESC",
                )
                .map_err(StorageError::from)?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(StorageError::from)?;

            let mut files = Vec::new();
            for row in rows {
                let (id, path, original_name, mime, size, sha256, created_at) =
                    row.map_err(StorageError::from)?;
                files.push(FileRef {
                    id,
                    path: path.into(),
                    original_name,
                    mime,
                    size: size.max(0) as u64,
                    sha256,
                    created_at: parse_time(&created_at)?,
                });
            }
            Ok(files)
        })
        .await
    }
}

/// A `runs` row before validation
struct RawRun {
    id: String,
    status: String,
    inputs: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            inputs: row.get(2)?,
            created_at: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            error: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StorageError::CorruptRecord(format!("run id {}: {}", self.id, e)))?;
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            StorageError::CorruptRecord(format!("run {}: unknown status '{}'", id, self.status))
        })?;
        let inputs: RunInputs = serde_json::from_str(&self.inputs).map_err(StorageError::from)?;

        Ok(RunRecord {
            id,
            inputs,
            status,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            error: self.error,
        })
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRecord(format!("timestamp '{}': {}", value, e)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InputValue;

    fn record(task: &str) -> RunRecord {
        let mut inputs = RunInputs::new();
        inputs.insert("task".to_string(), InputValue::from(task));
        inputs.insert("verbose".to_string(), InputValue::Flag(true));
        RunRecord::new(inputs)
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let store = RunStore::open_in_memory().unwrap();
        let run = record("2+2");

        store.insert_run(&run).await.unwrap();
        let loaded = store.get_run(run.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.inputs, run.inputs);
        assert!(store.get_run(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status() {
        let store = RunStore::open_in_memory().unwrap();
        let mut run = record("2+2");
        store.insert_run(&run).await.unwrap();

        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.error = Some("boom".to_string());
        store.update_status(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_update_unknown_run() {
        let store = RunStore::open_in_memory().unwrap();
        let result = store.update_status(&record("x")).await;
        assert!(matches!(result, Err(EngineError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_and_filter_runs() {
        let store = RunStore::open_in_memory().unwrap();

        let mut done = record("a");
        done.created_at = Utc::now() - chrono::Duration::seconds(10);
        done.status = RunStatus::Completed;
        store.insert_run(&done).await.unwrap();

        let pending = record("b");
        store.insert_run(&pending).await.unwrap();

        let recent = store.list_runs(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, pending.id);

        assert_eq!(store.list_runs(1).await.unwrap().len(), 1);

        let open = store
            .runs_with_status(&[RunStatus::Pending, RunStatus::Running])
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_uploads() {
        let store = RunStore::open_in_memory().unwrap();
        let file = FileRef {
            id: Uuid::new_v4().to_string(),
            path: "/data/uploads/notes.txt".into(),
            original_name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 5,
            sha256: "ab".repeat(32),
            created_at: Utc::now(),
        };

        store.save_upload(&file).await.unwrap();
        let uploads = store.list_uploads().await.unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].id, file.id);
        assert_eq!(uploads[0].size, 5);
    }
}
