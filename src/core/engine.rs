//! The run engine: owns every component and their lifecycle.

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::artifacts::ArtifactStore;
use super::controller::RunController;
use super::event_log::{EventLog, JsonlEventLog};
use super::executor::Executor;
use super::gateway::{EventStream, StreamGateway};
use super::registry::RunRegistry;
use super::run_store::RunStore;
use super::safety::InputLimits;
use crate::adapters::Agent;
use crate::config::Config;
use crate::domain::{terminal_outcome, Event, EventKind, FileRef, RunInputs, RunRecord, RunStatus};
use crate::error::{EngineError, Result, StorageError};

/// Message recorded for runs a previous process left unfinished
pub const INTERRUPTED_MESSAGE: &str = "run interrupted by engine restart";

/// A running engine bound to one data directory
pub struct Engine {
    config: Config,
    registry: Arc<RunRegistry>,
    store: RunStore,
    log: Arc<dyn EventLog>,
    artifacts: ArtifactStore,
    controller: RunController,
    gateway: StreamGateway,

    /// Held for the engine's lifetime; dropping it releases the data directory
    _lock: File,
}

impl Engine {
    /// Open the engine over `config.data_dir` with the JSONL event log
    pub async fn open(config: Config, agent: Arc<dyn Agent>) -> Result<Self> {
        let log = Arc::new(JsonlEventLog::new(config.runs_dir()));
        Self::open_with_log(config, agent, log).await
    }

    /// Open the engine with a custom event log
    pub async fn open_with_log(
        config: Config,
        agent: Arc<dyn Agent>,
        log: Arc<dyn EventLog>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(StorageError::from)?;
        let lock = acquire_lock(&config)?;

        let store = RunStore::open(&config.database_path())?;
        let limits = InputLimits::from(&config.inputs);
        let registry = Arc::new(RunRegistry::new(
            config.engine.subscriber_buffer,
            config.engine.max_active_runs,
        ));
        let artifacts = ArtifactStore::new(
            config.uploads_dir(),
            config.runs_dir(),
            store.clone(),
            limits.clone(),
        );
        let executor = Arc::new(Executor::new(
            agent,
            log.clone(),
            registry.clone(),
            store.clone(),
            artifacts.clone(),
            config.engine.run_timeout(),
        ));
        let controller = RunController::new(limits, registry.clone(), store.clone(), executor);
        let gateway = StreamGateway::new(registry.clone(), store.clone(), log.clone());

        let engine = Self {
            config,
            registry,
            store,
            log,
            artifacts,
            controller,
            gateway,
            _lock: lock,
        };

        let recovered = engine.recover().await?;
        info!(
            data_dir = %engine.config.data_dir.display(),
            recovered,
            "Engine opened"
        );

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a run and start it; returns its id without waiting
    pub async fn create_run(&self, inputs: RunInputs) -> Result<Uuid> {
        self.controller.create_run(inputs).await
    }

    /// Stream a run's events from `from_seq` (0 = full history)
    pub async fn open_stream(&self, run_id: Uuid, from_seq: u64) -> Result<EventStream> {
        self.gateway.open(run_id, from_seq).await
    }

    /// Current record for a run
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord> {
        if let Some(handle) = self.registry.get(run_id) {
            return Ok(handle.snapshot());
        }
        self.store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Every event a run has recorded so far
    pub async fn read_log(&self, run_id: Uuid) -> Result<Vec<Event>> {
        // Existence check so unknown ids are not mistaken for empty runs
        self.get_run(run_id).await?;
        self.log.read_range(run_id, 0).await
    }

    /// Most recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.store.list_runs(limit).await
    }

    /// Store an uploaded file for use as a run input
    pub async fn save_upload(&self, original_name: &str, mime: &str, bytes: &[u8]) -> Result<FileRef> {
        self.artifacts.save_upload(original_name, mime, bytes).await
    }

    pub async fn list_uploads(&self) -> Result<Vec<FileRef>> {
        self.artifacts.list_uploads().await
    }

    /// Resolve with a run's terminal status
    pub async fn wait_for(&self, run_id: Uuid) -> Result<RunStatus> {
        if let Some(handle) = self.registry.get(run_id) {
            return Ok(handle.wait_terminal().await);
        }
        let record = self.get_run(run_id).await?;
        Ok(record.status)
    }

    /// Number of runs not yet terminal
    pub fn active_runs(&self) -> usize {
        self.registry.active_count()
    }

    /// Runs held in memory; finished runs leave once their status is stored
    pub fn tracked_runs(&self) -> usize {
        self.registry.tracked_count()
    }

    pub fn is_accepting(&self) -> bool {
        !self.registry.is_shutting_down()
    }

    /// Refuse new runs and wait up to the grace period for active ones.
    ///
    /// Returns `false` if runs were still active when the grace period ran out.
    pub async fn shutdown(&self) -> bool {
        self.registry.begin_shutdown();
        let active = self.registry.active_count();
        info!(active, "Engine shutting down");

        let grace = self.config.engine.shutdown_grace();
        match tokio::time::timeout(grace, self.registry.wait_idle()).await {
            Ok(()) => {
                info!("All runs finished");
                true
            }
            Err(_) => {
                warn!(
                    active = self.registry.active_count(),
                    grace_secs = grace.as_secs(),
                    "Grace period expired with runs still active"
                );
                false
            }
        }
    }

    /// Settle runs a previous process left pending or running.
    ///
    /// The log is the source of truth: a run whose log already ends in a
    /// terminal event takes that outcome; anything else is failed with an
    /// appended `error` event.
    async fn recover(&self) -> Result<usize> {
        let stale = self
            .store
            .runs_with_status(&[RunStatus::Pending, RunStatus::Running])
            .await?;

        for mut record in stale.iter().cloned() {
            let run_id = record.id;
            let events = self.log.read_range(run_id, 0).await?;

            match terminal_outcome(&events) {
                Some((status, error)) => {
                    record.status = status;
                    record.error = error;
                    record.finished_at = events.last().map(|e| e.timestamp);
                    info!(%run_id, %status, "Reconciled run status from log");
                }
                None => {
                    let event = self
                        .log
                        .append(run_id, EventKind::error(INTERRUPTED_MESSAGE))
                        .await?;
                    record.status = RunStatus::Failed;
                    record.error = Some(INTERRUPTED_MESSAGE.to_string());
                    record.finished_at = Some(event.timestamp);
                    warn!(%run_id, "Failed run interrupted by restart");
                }
            }

            self.store.update_status(&record).await?;
            self.log.release(run_id);
        }

        Ok(stale.len())
    }
}

fn acquire_lock(config: &Config) -> Result<File> {
    let path = config.lock_path();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(StorageError::from)?;

    fs2::FileExt::try_lock_exclusive(&file).map_err(|_| {
        EngineError::EngineUnavailable(format!(
            "data directory {} is in use by another engine",
            config.data_dir.display()
        ))
    })?;

    Ok(file)
}
