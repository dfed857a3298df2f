//! Agent interfaces for triggered computations.
//!
//! An agent is the opaque computation a run executes. It reports progress
//! through an [`EventSink`] and produces files through its [`RunContext`].

pub mod echo;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::core::artifacts::write_artifact;
use crate::domain::{ArtifactRef, RunInputs};
use crate::error::EngineError;

// Re-export the built-in agent
pub use echo::EchoAgent;

/// Everything an agent gets to know about the run it is executing
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run being executed
    pub run_id: Uuid,

    /// Inputs the run was triggered with
    pub inputs: RunInputs,

    artifacts_dir: PathBuf,
}

impl RunContext {
    pub fn new(run_id: Uuid, inputs: RunInputs, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            inputs,
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Text value of an input field, if present
    pub fn text(&self, field: &str) -> Option<&str> {
        self.inputs.get(field).and_then(|value| value.as_text())
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Store a produced file and get a reference for the `final` event
    pub async fn write_artifact(
        &self,
        name: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<ArtifactRef, EngineError> {
        write_artifact(&self.artifacts_dir, name, content.as_ref()).await
    }
}

/// Ordered event output of a running computation.
///
/// Each call returns once the event is durable and published. Exactly one
/// terminal call (`emit_final` or `emit_error`) is expected; anything
/// emitted after it is rejected.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit_token(&self, text: &str) -> Result<(), EngineError>;

    async fn emit_tool_start(&self, tool: &str, input: Value) -> Result<(), EngineError>;

    /// Rejected unless a `tool_start` for `tool` is still open
    async fn emit_tool_end(&self, tool: &str, output: Value) -> Result<(), EngineError>;

    async fn emit_final(&self, text: &str, artifacts: Vec<ArtifactRef>) -> Result<(), EngineError>;

    async fn emit_error(&self, message: &str) -> Result<(), EngineError>;
}

/// Trait for triggered computations
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable agent name
    fn name(&self) -> &str;

    /// Execute one run.
    ///
    /// Returning an error (or panicking) fails the run; returning `Ok`
    /// without a terminal event fails it too.
    async fn run(&self, ctx: &RunContext, sink: &dyn EventSink) -> Result<()>;
}
