//! Append-only event log with file-based persistence.
//!
//! Each run gets `runs/<run_id>/events.jsonl`: one JSON event per line, in
//! sequence order. A line only counts once its trailing newline is on disk,
//! so a reader racing a writer (or a crash mid-write) never sees half an event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Event, EventKind};
use crate::error::{Result, StorageError};

/// Durable, per-run ordered event storage
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist an event and return it with its assigned sequence number.
    ///
    /// The event is durable once this returns. Appends for the same run are
    /// serialized; sequence numbers start at 1 and are gapless.
    async fn append(&self, run_id: Uuid, kind: EventKind) -> Result<Event>;

    /// All events of a run with `seq >= from_seq`, in order
    async fn read_range(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<Event>>;

    /// Drop any per-run writer state once a run will not be appended to again
    fn release(&self, _run_id: Uuid) {}
}

/// Writer state for one run's log file
struct RunWriter {
    path: PathBuf,
    file: Option<File>,
    next_seq: u64,
}

impl RunWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            next_seq: 1,
        }
    }

    /// Open the events file for appending, recovering the next sequence
    /// number and cutting off any torn trailing line.
    async fn open(&mut self, run_id: Uuid) -> Result<()> {
        if let Some(run_dir) = self.path.parent() {
            fs::create_dir_all(run_dir).await.map_err(StorageError::from)?;
        }

        let mut next_seq = 1;

        if self.path.exists() {
            let bytes = fs::read(&self.path).await.map_err(StorageError::from)?;
            let committed = committed_len(&bytes);

            if committed < bytes.len() {
                warn!(
                    %run_id,
                    torn_bytes = bytes.len() - committed,
                    "Truncating torn trailing line in event log"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .await
                    .map_err(StorageError::from)?;
                file.set_len(committed as u64)
                    .await
                    .map_err(StorageError::from)?;
                file.sync_all().await.map_err(StorageError::from)?;
            }

            if let Some(last) = parse_lines(&self.path, &bytes[..committed])?.last() {
                next_seq = last.seq + 1;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(StorageError::from)?;

        self.file = Some(file);
        self.next_seq = next_seq;
        Ok(())
    }

    async fn append(&mut self, run_id: Uuid, kind: EventKind) -> Result<Event> {
        if self.file.is_none() {
            self.open(run_id).await?;
        }

        let event = Event::new(run_id, self.next_seq, kind);
        let mut line = serde_json::to_string(&event).map_err(StorageError::from)?;
        line.push('\n');

        let written = match self.file.as_mut() {
            Some(file) => write_durably(file, line.as_bytes()).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "event log file not open",
            )),
        };

        if let Err(err) = written {
            // Reopen on the next append so a partial line gets truncated
            self.file = None;
            return Err(StorageError::from(err).into());
        }

        self.next_seq += 1;
        debug!(%run_id, seq = event.seq, kind = event.kind.name(), "Appended event");

        Ok(event)
    }
}

/// JSONL event log rooted at a runs directory
pub struct JsonlEventLog {
    /// Directory containing one subdirectory per run
    runs_dir: PathBuf,

    /// Per-run writers; the mutex serializes appends for that run only
    writers: DashMap<Uuid, Arc<Mutex<RunWriter>>>,
}

impl JsonlEventLog {
    /// Open a log rooted at `runs_dir` (created lazily on first append)
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            writers: DashMap::new(),
        }
    }

    /// Directory for a run's files
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    /// Path to a run's events file
    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn writer(&self, run_id: Uuid) -> Arc<Mutex<RunWriter>> {
        self.writers
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunWriter::new(self.events_path(run_id)))))
            .clone()
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, run_id: Uuid, kind: EventKind) -> Result<Event> {
        let writer = self.writer(run_id);

        // Detached so a cancelled caller cannot stop a write between the
        // line reaching disk and the sequence number advancing
        let task = tokio::spawn(async move { writer.lock().await.append(run_id, kind).await });

        task.await.map_err(|e| {
            StorageError::Unavailable(format!("event append task failed: {}", e))
        })?
    }

    async fn read_range(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<Event>> {
        let path = self.events_path(run_id);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::from(err).into()),
        };

        let committed = committed_len(&bytes);
        let events = parse_lines(&path, &bytes[..committed])?;

        Ok(events.into_iter().filter(|e| e.seq >= from_seq).collect())
    }

    fn release(&self, run_id: Uuid) {
        self.writers.remove(&run_id);
    }
}

async fn write_durably(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Length of the prefix that ends with the last newline
fn committed_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0)
}

fn parse_lines(path: &Path, bytes: &[u8]) -> Result<Vec<Event>> {
    let content = std::str::from_utf8(bytes).map_err(|e| StorageError::CorruptLog {
        path: path.to_path_buf(),
        line: 0,
        reason: e.to_string(),
    })?;

    let mut events = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line).map_err(|e| StorageError::CorruptLog {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        events.push(event);
    }

    Ok(events)
}
