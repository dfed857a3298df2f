//! Error taxonomy for the run engine.
//!
//! Computation failures never surface here as raw errors past the executor:
//! they are recorded as terminal `error` events. The variants below are what
//! callers of the engine API (controller, gateway, storage) can observe.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::RunStatus;

/// Errors returned by the run engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Trigger rejected before any run state was created
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine is not accepting new runs
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Durable read or write failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No run with this identifier exists
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// The opaque computation failed
    #[error("Computation failed: {0}")]
    Computation(String),

    /// The run already has a terminal event
    #[error("Run {0} has already terminated")]
    RunTerminated(Uuid),

    /// A tool_end was emitted without a matching tool_start
    #[error("Tool '{tool}' ended without a matching start")]
    ToolNotStarted { tool: String },

    #[error("Invalid run status transition: {from} → {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// The subscriber fell behind and its live feed was closed
    #[error("Subscriber to run {run_id} lagged; resume from sequence {next_seq}")]
    SubscriberLagged { run_id: Uuid, next_seq: u64 },
}

/// Failures of the durable medium (event log, run store, artifact files)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt event log {path}: line {line}: {reason}")]
    CorruptLog {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(StorageError::Io(err))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization(err))
    }
}

/// Result alias used throughout the engine API
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
