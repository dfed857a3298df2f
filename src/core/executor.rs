//! Run execution.
//!
//! Drives one run from `pending` to a terminal status: invokes the agent once
//! on its own task, turns every sink call into an ordered append + publish,
//! and converts any failure (error, panic, timeout, storage) into a terminal
//! `error` event.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::artifacts::ArtifactStore;
use super::broadcast::BroadcastChannel;
use super::event_log::EventLog;
use super::registry::{RunHandle, RunRegistry};
use super::run_store::RunStore;
use crate::adapters::{Agent, EventSink, RunContext};
use crate::domain::{ArtifactRef, EventKind, RunStatus};
use crate::error::{EngineError, Result};

/// Message recorded when a computation returns without a terminal event
pub const MISSING_TERMINAL_MESSAGE: &str = "computation finished without emitting a result";

#[derive(Default)]
struct SinkState {
    /// Outcome of the terminal event, once appended
    terminal: Option<(RunStatus, Option<String>)>,

    /// Open `tool_start` count per tool name
    open_tools: HashMap<String, usize>,
}

struct SinkInner {
    run_id: Uuid,
    log: Arc<dyn EventLog>,
    channel: Arc<BroadcastChannel>,
    state: Mutex<SinkState>,
}

impl SinkInner {
    /// Append then publish, serialized per run
    async fn emit(&self, kind: EventKind) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.terminal.is_some() {
            warn!(run_id = %self.run_id, kind = kind.name(), "Emit after terminal event rejected");
            return Err(EngineError::RunTerminated(self.run_id));
        }

        if let EventKind::ToolEnd { tool, .. } = &kind {
            if state.open_tools.get(tool).copied().unwrap_or(0) == 0 {
                return Err(EngineError::ToolNotStarted { tool: tool.clone() });
            }
        }

        let event = self.log.append(self.run_id, kind).await?;

        match &event.kind {
            EventKind::ToolStart { tool, .. } => {
                *state.open_tools.entry(tool.clone()).or_insert(0) += 1;
            }
            EventKind::ToolEnd { tool, .. } => {
                if let Some(open) = state.open_tools.get_mut(tool) {
                    *open -= 1;
                    if *open == 0 {
                        state.open_tools.remove(tool);
                    }
                }
            }
            EventKind::Final { .. } => state.terminal = Some((RunStatus::Completed, None)),
            EventKind::Error { message } => {
                state.terminal = Some((RunStatus::Failed, Some(message.clone())))
            }
            EventKind::Token { .. } => {}
        }

        self.channel.publish(&event);
        Ok(())
    }
}

/// The executor's event sink: sole writer and publisher for one run
pub struct RunSink {
    inner: Arc<SinkInner>,
}

impl RunSink {
    pub fn new(run_id: Uuid, log: Arc<dyn EventLog>, channel: Arc<BroadcastChannel>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                run_id,
                log,
                channel,
                state: Mutex::new(SinkState::default()),
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Run one emit to completion on its own task.
    ///
    /// An aborted computation stops waiting, but an emit that already started
    /// still appends, updates the sink state and publishes as one step.
    async fn emit(&self, kind: EventKind) -> Result<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.emit(kind).await })
            .await
            .map_err(|e| EngineError::Computation(format!("event emit task failed: {}", e)))?
    }

    /// Settle the run's outcome once the computation is done.
    ///
    /// A terminal event already in the log wins. Otherwise an `error` event
    /// carrying `failure` (or the missing-terminal message) is appended; if
    /// even that append fails the run is still reported failed.
    async fn finish(&self, failure: Option<String>) -> (RunStatus, Option<String>) {
        let mut state = self.inner.state.lock().await;
        if let Some(outcome) = state.terminal.clone() {
            if let Some(failure) = failure {
                warn!(run_id = %self.inner.run_id, %failure, "Computation failed after its terminal event");
            }
            return outcome;
        }

        let message = failure.unwrap_or_else(|| MISSING_TERMINAL_MESSAGE.to_string());
        match self
            .inner
            .log
            .append(self.inner.run_id, EventKind::error(message.clone()))
            .await
        {
            Ok(event) => self.inner.channel.publish(&event),
            Err(e) => {
                error!(run_id = %self.inner.run_id, error = %e, "Could not record terminal error event")
            }
        }

        // Later emits are rejected even if the append above failed
        state.terminal = Some((RunStatus::Failed, Some(message.clone())));
        (RunStatus::Failed, Some(message))
    }
}

#[async_trait]
impl EventSink for RunSink {
    async fn emit_token(&self, text: &str) -> Result<()> {
        self.emit(EventKind::token(text)).await
    }

    async fn emit_tool_start(&self, tool: &str, input: Value) -> Result<()> {
        self.emit(EventKind::ToolStart {
            tool: tool.to_string(),
            input,
        })
        .await
    }

    async fn emit_tool_end(&self, tool: &str, output: Value) -> Result<()> {
        self.emit(EventKind::ToolEnd {
            tool: tool.to_string(),
            output,
        })
        .await
    }

    async fn emit_final(&self, text: &str, artifacts: Vec<ArtifactRef>) -> Result<()> {
        self.emit(EventKind::final_result(text, artifacts)).await
    }

    async fn emit_error(&self, message: &str) -> Result<()> {
        self.emit(EventKind::error(message)).await
    }
}

/// Runs computations for registered runs
pub struct Executor {
    agent: Arc<dyn Agent>,
    log: Arc<dyn EventLog>,
    registry: Arc<RunRegistry>,
    store: RunStore,
    artifacts: ArtifactStore,
    run_timeout: Duration,
}

impl Executor {
    pub fn new(
        agent: Arc<dyn Agent>,
        log: Arc<dyn EventLog>,
        registry: Arc<RunRegistry>,
        store: RunStore,
        artifacts: ArtifactStore,
        run_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            log,
            registry,
            store,
            artifacts,
            run_timeout,
        }
    }

    /// Start a registered run on its own task
    pub fn spawn(self: &Arc<Self>, handle: Arc<RunHandle>) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move { executor.execute(handle).await })
    }

    #[instrument(skip(self, handle), fields(run_id = %handle.id(), agent = %self.agent.name()))]
    async fn execute(&self, handle: Arc<RunHandle>) {
        let run_id = handle.id();
        let sink = Arc::new(RunSink::new(
            run_id,
            self.log.clone(),
            handle.channel().clone(),
        ));

        let failure = match self.registry.mark_running(run_id) {
            Ok(record) => {
                if let Err(e) = self.store.update_status(&record).await {
                    warn!(error = %e, "Failed to persist running status");
                }
                info!("Run started");
                self.run_computation(&handle, sink.clone()).await
            }
            Err(e) => {
                error!(error = %e, "Run could not be started");
                Some(format!("run could not be started: {}", e))
            }
        };

        let (status, message) = sink.finish(failure).await;
        self.settle(run_id, status, message).await;
        self.log.release(run_id);
    }

    /// Record the terminal status, then drop the run from memory once the
    /// store holds it
    async fn settle(&self, run_id: Uuid, status: RunStatus, message: Option<String>) {
        match self.registry.mark_terminal(run_id, status, message) {
            Ok(record) => match self.store.update_status(&record).await {
                Ok(()) => self.registry.evict(run_id),
                Err(e) => error!(error = %e, "Failed to persist terminal status"),
            },
            Err(e) => {
                error!(error = %e, "Failed to mark run terminal");
                self.registry.discard(run_id);
            }
        }
    }

    /// Invoke the agent once; `Some(message)` if it failed
    async fn run_computation(&self, handle: &RunHandle, sink: Arc<RunSink>) -> Option<String> {
        let run_id = handle.id();
        let ctx = RunContext::new(run_id, handle.inputs(), self.artifacts.artifacts_dir(run_id));
        let agent = self.agent.clone();

        // A child task contains panics and lets a timeout abort the computation
        let mut task = tokio::spawn(async move { agent.run(&ctx, sink.as_ref()).await });

        match tokio::time::timeout(self.run_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {
                debug!("Computation returned");
                None
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Computation failed");
                Some(format!("{:#}", e))
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(%message, "Computation panicked");
                Some(format!("computation panicked: {}", message))
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "Computation task cancelled");
                Some(format!("computation task cancelled: {}", join_error))
            }
            Err(_) => {
                task.abort();
                let secs = self.run_timeout.as_secs_f64();
                warn!(timeout_secs = secs, "Computation timed out");
                Some(format!("computation timed out after {}s", secs))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
