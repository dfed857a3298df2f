//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

use agentkit::core::{EventLog, EventStream, JsonlEventLog};
use agentkit::{
    Agent, Config, Engine, EngineError, Event, EventKind, EventSink, InputValue, RunContext,
    RunInputs, StorageError,
};

/// One scripted action
#[derive(Debug, Clone)]
pub enum Step {
    Token(&'static str),
    ToolStart(&'static str),
    ToolEnd(&'static str),
    Final(&'static str),
    Error(&'static str),
    /// Return an error from the computation
    Fail(&'static str),
    Panic(&'static str),
    Sleep(Duration),
    /// Block until the test adds a permit to the gate
    Gate,
}

/// Agent that plays back a fixed script
pub struct ScriptAgent {
    steps: Vec<Step>,
    gate: Arc<Semaphore>,
}

impl ScriptAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Handle for releasing `Step::Gate`
    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }
}

#[async_trait]
impl Agent for ScriptAgent {
    fn name(&self) -> &str {
        "script"
    }

    async fn run(&self, _ctx: &RunContext, sink: &dyn EventSink) -> Result<()> {
        for step in &self.steps {
            match step {
                Step::Token(text) => sink.emit_token(text).await?,
                Step::ToolStart(tool) => sink.emit_tool_start(tool, json!({})).await?,
                Step::ToolEnd(tool) => sink.emit_tool_end(tool, json!({})).await?,
                Step::Final(text) => sink.emit_final(text, vec![]).await?,
                Step::Error(message) => sink.emit_error(message).await?,
                Step::Fail(message) => bail!("{}", message),
                Step::Panic(message) => panic!("{}", message),
                Step::Sleep(duration) => tokio::time::sleep(*duration).await,
                Step::Gate => self.gate.acquire().await?.forget(),
            }
        }
        Ok(())
    }
}

/// Event log that starts failing after a number of successful appends
pub struct FailingLog {
    inner: JsonlEventLog,
    remaining: AtomicUsize,
}

impl FailingLog {
    pub fn new(inner: JsonlEventLog, successful_appends: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(successful_appends),
        }
    }
}

#[async_trait]
impl EventLog for FailingLog {
    async fn append(&self, run_id: Uuid, kind: EventKind) -> agentkit::Result<Event> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(EngineError::Storage(StorageError::Unavailable(
                "disk full".to_string(),
            )));
        }
        self.inner.append(run_id, kind).await
    }

    async fn read_range(&self, run_id: Uuid, from_seq: u64) -> agentkit::Result<Vec<Event>> {
        self.inner.read_range(run_id, from_seq).await
    }
}

/// Config rooted in a temp dir with test-friendly limits
pub fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::with_data_dir(temp.path().join("data"));
    config.engine.run_timeout_seconds = 10;
    config.engine.shutdown_grace_seconds = 5;
    config
}

pub async fn open_engine(temp: &TempDir, agent: impl Agent + 'static) -> Engine {
    Engine::open(test_config(temp), Arc::new(agent)).await.unwrap()
}

pub fn inputs(pairs: &[(&str, &str)]) -> RunInputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), InputValue::from(*v)))
        .collect()
}

pub fn task(text: &str) -> RunInputs {
    inputs(&[("task", text)])
}

/// Drain a stream to its end, panicking on stream errors
pub async fn collect(mut stream: EventStream) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.unwrap());
    }
    events
}

pub fn seqs(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.seq).collect()
}

pub fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

/// Poll until the run's log holds at least `count` events
pub async fn wait_for_events(engine: &Engine, run_id: Uuid, count: usize) -> Vec<Event> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let events = engine.read_log(run_id).await.unwrap();
        if events.len() >= count {
            return events;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} events, have {}",
            count,
            events.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
