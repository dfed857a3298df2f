//! In-memory index of active and recently finished runs.
//!
//! The registry owns each live run's status and broadcast channel. It is held
//! by the engine and only mutated through the operations below. A finished run
//! stays until the executor has persisted its terminal status, then is evicted.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use super::broadcast::BroadcastChannel;
use crate::domain::{RunInputs, RunRecord, RunStatus};
use crate::error::{EngineError, Result};

/// Registry entry for one run
pub struct RunHandle {
    record: Mutex<RunRecord>,
    status: watch::Sender<RunStatus>,
    channel: Arc<BroadcastChannel>,
}

impl RunHandle {
    fn new(record: RunRecord, subscriber_buffer: usize) -> Self {
        let (status, _) = watch::channel(record.status);
        let channel = BroadcastChannel::new(record.id, subscriber_buffer);
        Self {
            record: Mutex::new(record),
            status,
            channel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.snapshot().id
    }

    pub fn inputs(&self) -> RunInputs {
        self.snapshot().inputs
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Copy of the current run record
    pub fn snapshot(&self) -> RunRecord {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn channel(&self) -> &Arc<BroadcastChannel> {
        &self.channel
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait_terminal(&self) -> RunStatus {
        let mut rx = self.status.subscribe();
        let result = rx.wait_for(|status| status.is_terminal()).await;
        match result {
            Ok(status) => *status,
            // The sender lives as long as this handle
            Err(_) => self.status(),
        }
    }

    fn transition(&self, next: RunStatus, error: Option<String>) -> Result<RunRecord> {
        let mut record = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !record.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: record.status,
                to: next,
            });
        }

        record.status = next;
        match next {
            RunStatus::Running => record.started_at = Some(Utc::now()),
            RunStatus::Completed | RunStatus::Failed => {
                record.finished_at = Some(Utc::now());
                record.error = error;
            }
            RunStatus::Pending => {}
        }

        self.status.send_replace(next);
        Ok(record.clone())
    }
}

/// Index of runs known to this process
pub struct RunRegistry {
    runs: DashMap<Uuid, Arc<RunHandle>>,
    subscriber_buffer: usize,
    max_active_runs: usize,
    active: AtomicUsize,
    shutting_down: AtomicBool,
    idle: Notify,
}

impl RunRegistry {
    /// Create a registry; `max_active_runs == 0` means unlimited
    pub fn new(subscriber_buffer: usize, max_active_runs: usize) -> Self {
        Self {
            runs: DashMap::new(),
            subscriber_buffer,
            max_active_runs,
            active: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    /// Register a new pending run
    pub fn insert(&self, record: RunRecord) -> Result<Arc<RunHandle>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::EngineUnavailable(
                "engine is shutting down".to_string(),
            ));
        }

        // Reserve an active slot atomically so concurrent triggers cannot
        // overshoot the limit
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                if self.max_active_runs > 0 && active >= self.max_active_runs {
                    None
                } else {
                    Some(active + 1)
                }
            });
        if reserved.is_err() {
            return Err(EngineError::EngineUnavailable(format!(
                "{} runs already active",
                self.max_active_runs
            )));
        }

        let run_id = record.id;
        let handle = Arc::new(RunHandle::new(record, self.subscriber_buffer));
        self.runs.insert(run_id, handle.clone());
        debug!(%run_id, "Run registered");

        Ok(handle)
    }

    /// Forget a pending run that was never started, releasing its slot
    pub fn discard(&self, run_id: Uuid) {
        let Some((_, handle)) = self
            .runs
            .remove_if(&run_id, |_, handle| handle.status() == RunStatus::Pending)
        else {
            return;
        };

        handle.channel.close();
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
        debug!(%run_id, "Run discarded");
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.get(&run_id).map(|entry| entry.value().clone())
    }

    /// Move a run from pending to running
    pub fn mark_running(&self, run_id: Uuid) -> Result<RunRecord> {
        let handle = self.get(run_id).ok_or(EngineError::RunNotFound(run_id))?;
        handle.transition(RunStatus::Running, None)
    }

    /// Move a run to a terminal status and close its broadcast channel
    pub fn mark_terminal(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<RunRecord> {
        let handle = self.get(run_id).ok_or(EngineError::RunNotFound(run_id))?;
        let record = handle.transition(status, error)?;
        handle.channel.close();

        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            self.idle.notify_waiters();
        }

        info!(%run_id, %status, "Run finished");
        Ok(record)
    }

    /// Drop a terminal run; later lookups fall back to the run store
    pub fn evict(&self, run_id: Uuid) {
        if self
            .runs
            .remove_if(&run_id, |_, handle| handle.status().is_terminal())
            .is_some()
        {
            debug!(%run_id, "Run evicted from registry");
        }
    }

    /// Number of runs held in memory, terminal or not
    pub fn tracked_count(&self) -> usize {
        self.runs.len()
    }

    /// Number of runs not yet terminal
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Refuse new runs from now on
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolve once no run is active
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
