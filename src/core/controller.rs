//! Run creation.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::executor::Executor;
use super::registry::RunRegistry;
use super::run_store::RunStore;
use super::safety::InputLimits;
use crate::domain::{RunInputs, RunRecord};
use crate::error::Result;

/// Validates triggers and hands new runs to the executor
pub struct RunController {
    limits: InputLimits,
    registry: Arc<RunRegistry>,
    store: RunStore,
    executor: Arc<Executor>,
}

impl RunController {
    pub fn new(
        limits: InputLimits,
        registry: Arc<RunRegistry>,
        store: RunStore,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            limits,
            registry,
            store,
            executor,
        }
    }

    /// Create a run and start it asynchronously; returns without waiting.
    ///
    /// On any error no run state is left behind.
    #[instrument(skip(self, inputs), fields(fields = inputs.len()))]
    pub async fn create_run(&self, inputs: RunInputs) -> Result<Uuid> {
        self.limits.validate_inputs(&inputs)?;

        let record = RunRecord::new(inputs);
        let run_id = record.id;

        // Registering first reserves the active slot
        let handle = self.registry.insert(record.clone())?;

        if let Err(e) = self.store.insert_run(&record).await {
            warn!(%run_id, error = %e, "Failed to persist new run");
            self.registry.discard(run_id);
            return Err(e);
        }

        self.executor.spawn(handle);
        info!(%run_id, "Run created");

        Ok(run_id)
    }
}
