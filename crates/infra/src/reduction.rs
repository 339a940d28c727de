//! Reduction step execution.
//!
//! The reduction step is the terminal aggregation of a gated job. It never goes out
//! on the work channel; the maintenance pass hands it to a [`ReductionStepExecutor`]
//! which then owns the instance until it leaves `Finalize`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use stepgate_core::{
    InstanceId, InstanceStatus, JobInstance, StepId, WorkChunk, WorkChunkStatus, WorkCursor,
};

use crate::persistence::{JobPersistence, PersistenceError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReductionError {
    #[error("step {0} is not a reduction step")]
    NotAReductionStep(StepId),

    #[error("no reducer registered for job definition {0}")]
    NoReducer(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Runs a job's reduction step synchronously.
pub trait ReductionStepExecutor: Send + Sync {
    fn trigger_reduction_step(
        &self,
        instance_id: &InstanceId,
        cursor: &WorkCursor,
    ) -> Result<(), ReductionError>;
}

impl<R> ReductionStepExecutor for Arc<R>
where
    R: ReductionStepExecutor + ?Sized,
{
    fn trigger_reduction_step(
        &self,
        instance_id: &InstanceId,
        cursor: &WorkCursor,
    ) -> Result<(), ReductionError> {
        (**self).trigger_reduction_step(instance_id, cursor)
    }
}

/// Reducer function: aggregates the reduction step's chunks into a JSON report.
pub type Reducer =
    Box<dyn Fn(&JobInstance, &[WorkChunk]) -> Result<serde_json::Value, String> + Send + Sync>;

/// In-process reduction executor with reducers registered per job definition id.
pub struct LocalReductionExecutor<P> {
    persistence: P,
    reducers: HashMap<String, Reducer>,
}

impl<P: JobPersistence> LocalReductionExecutor<P> {
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            reducers: HashMap::new(),
        }
    }

    /// Register the reducer for every version of `job_definition_id`.
    pub fn register_reducer<F>(&mut self, job_definition_id: impl Into<String>, reducer: F)
    where
        F: Fn(&JobInstance, &[WorkChunk]) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.reducers.insert(job_definition_id.into(), Box::new(reducer));
    }

    /// Walk the step's READY chunks up to IN_PROGRESS. Chunks lost to a racing
    /// claimant are left to it.
    fn start_chunks(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
    ) -> Result<Vec<WorkChunk>, PersistenceError> {
        let ready: Vec<WorkChunk> = self
            .persistence
            .fetch_ready_chunks(instance_id)?
            .filter(|chunk| &chunk.target_step_id == step_id)
            .collect();

        let mut started = Vec::with_capacity(ready.len());
        for mut chunk in ready {
            if self.persistence.claim_chunk(&chunk.id)? == 0 {
                continue;
            }
            if self.persistence.transition_chunk(
                &chunk.id,
                WorkChunkStatus::Queued,
                WorkChunkStatus::InProgress,
                None,
            )? == 0
            {
                continue;
            }
            chunk.status = WorkChunkStatus::InProgress;
            started.push(chunk);
        }
        Ok(started)
    }

    fn finish_chunks(
        &self,
        chunks: &[WorkChunk],
        outcome: WorkChunkStatus,
        error_message: Option<&str>,
    ) -> Result<(), PersistenceError> {
        for chunk in chunks {
            self.persistence.transition_chunk(
                &chunk.id,
                WorkChunkStatus::InProgress,
                outcome,
                error_message.map(str::to_string),
            )?;
        }
        Ok(())
    }
}

impl<P: JobPersistence> ReductionStepExecutor for LocalReductionExecutor<P> {
    fn trigger_reduction_step(
        &self,
        instance_id: &InstanceId,
        cursor: &WorkCursor,
    ) -> Result<(), ReductionError> {
        let step_id = cursor.current_step_id();
        if !cursor.is_reduction_step() {
            return Err(ReductionError::NotAReductionStep(step_id.clone()));
        }
        let definition_id = cursor.job_definition().id();
        let reducer = self
            .reducers
            .get(definition_id)
            .ok_or_else(|| ReductionError::NoReducer(definition_id.to_string()))?;

        let claimed = self
            .persistence
            .update_instance(instance_id, &mut |row| row.update_status(InstanceStatus::Finalize))?;
        if !claimed {
            debug!(instance_id = %instance_id, step_id = %step_id, "reduction already claimed or instance gone");
            return Ok(());
        }
        info!(instance_id = %instance_id, step_id = %step_id, "reduction step started");

        // The instance is in Finalize from here on; the maintenance pass no longer
        // touches it, so every exit must leave it ended.
        if let Err(e) = self.reduce(instance_id, step_id, reducer) {
            self.abandon(instance_id, step_id, &e);
            return Err(e.into());
        }
        Ok(())
    }
}

impl<P: JobPersistence> LocalReductionExecutor<P> {
    fn reduce(
        &self,
        instance_id: &InstanceId,
        step_id: &StepId,
        reducer: &Reducer,
    ) -> Result<(), PersistenceError> {
        let chunks = self.start_chunks(instance_id, step_id)?;
        let Some(instance) = self.persistence.fetch_instance(instance_id)? else {
            return Ok(());
        };

        match reducer(&instance, &chunks) {
            Ok(report) => {
                self.finish_chunks(&chunks, WorkChunkStatus::Completed, None)?;
                let report = report.to_string();
                self.persistence.update_instance(instance_id, &mut |row| {
                    row.report = Some(report.clone());
                    row.progress = 1.0;
                    row.update_status(InstanceStatus::Completed)
                })?;
                info!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    chunks = chunks.len(),
                    "reduction step completed"
                );
            }
            Err(message) => {
                self.finish_chunks(&chunks, WorkChunkStatus::Failed, Some(&message))?;
                self.persistence.update_instance(instance_id, &mut |row| {
                    row.error_message = Some(message.clone());
                    row.update_status(InstanceStatus::Failed)
                })?;
                warn!(
                    instance_id = %instance_id,
                    step_id = %step_id,
                    error = %message,
                    "reduction step failed"
                );
            }
        }
        Ok(())
    }

    /// Fail an instance whose reduction broke off part way.
    fn abandon(&self, instance_id: &InstanceId, step_id: &StepId, cause: &PersistenceError) {
        let message = format!("reduction step {step_id} aborted: {cause}");
        let outcome = self.persistence.update_instance(instance_id, &mut |row| {
            if row.status != InstanceStatus::Finalize {
                return false;
            }
            row.error_message = Some(message.clone());
            row.update_status(InstanceStatus::Failed)
        });
        match outcome {
            Ok(_) => warn!(instance_id = %instance_id, step_id = %step_id, error = %cause, "reduction step aborted"),
            Err(e) => error!(
                instance_id = %instance_id,
                step_id = %step_id,
                error = %e,
                cause = %cause,
                "could not fail instance after aborted reduction; it stays in FINALIZE"
            ),
        }
    }
}
