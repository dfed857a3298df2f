//! Run records and status.
//!
//! A run is one execution of the triggered computation, from creation to a
//! terminal status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::FileRef;
use super::events::{Event, EventKind};

/// Named input values supplied by the widget layer
pub type RunInputs = BTreeMap<String, InputValue>;

/// A single coerced input value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Text field
    Text(String),

    /// Checkbox / button
    Flag(bool),

    /// Resolved file uploads
    Files(Vec<FileRef>),
}

impl InputValue {
    /// Text content, if this is a text field
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// File references, if this is an upload field
    pub fn files(&self) -> &[FileRef] {
        match self {
            Self::Files(files) => files,
            _ => &[],
        }
    }

    /// Empty text, false flags and empty file lists count as absent
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Flag(flag) => !flag,
            Self::Files(files) => files.is_empty(),
        }
    }
}

impl From<&str> for InputValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for InputValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Persisted metadata for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Inputs the run was triggered with
    pub inputs: RunInputs,

    /// Current status
    pub status: RunStatus,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the executor picked it up
    pub started_at: Option<DateTime<Utc>>,

    /// When it reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,

    /// Failure message for failed runs
    pub error: Option<String>,
}

impl RunRecord {
    /// Create a new pending run with a fresh identifier
    pub fn new(inputs: RunInputs) -> Self {
        Self {
            id: Uuid::new_v4(),
            inputs,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Check if the run has reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started
    Pending,

    /// Executor is running the computation
    Running,

    /// Ended with a `final` event
    Completed,

    /// Ended with an `error` event
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome recorded in a run's log, if any.
///
/// Returns the status implied by the last event together with the failure
/// message for `error` terminals. Used to reconcile stored run status with
/// the log, which is the source of truth.
pub fn terminal_outcome(events: &[Event]) -> Option<(RunStatus, Option<String>)> {
    match &events.last()?.kind {
        EventKind::Final { .. } => Some((RunStatus::Completed, None)),
        EventKind::Error { message } => Some((RunStatus::Failed, Some(message.clone()))),
        _ => None,
    }
}
