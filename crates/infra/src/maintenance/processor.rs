//! The job instance processor: one maintenance pass per instance.
//!
//! A pass is safe to run concurrently with other passes over the same instance,
//! on this process or another. Every instance write is a conditional update and
//! every chunk claim is a single conditional transition, so racing passes either
//! win or observe the winner's write and stop.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use stepgate_channel::{JobWorkNotification, WorkChannel};
use stepgate_core::{
    DispatchRoute, DomainError, GateDecision, InstanceId, InstanceStatus, JobDefinition,
    JobInstance, StepId, StepPosition, WorkCursor,
};

use crate::config::MaintenanceConfig;
use crate::persistence::{JobPersistence, PersistenceError};
use crate::progress::ProgressCalculator;
use crate::reduction::{ReductionError, ReductionStepExecutor};
use crate::registry::{JobDefinitionRegistry, RegistryError};

/// Failure of a single maintenance pass.
///
/// Nothing is retried inside a pass; the next scheduled pass is the retry.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("work notification publish failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Reduction(#[from] ReductionError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Whether the pass continues past cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    Proceed,
    Halt,
}

/// Outcome counts of [`JobInstanceProcessor::process_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Maintenance-pass orchestrator.
pub struct JobInstanceProcessor<P, C, R> {
    persistence: P,
    channel: C,
    registry: Arc<JobDefinitionRegistry>,
    reduction: R,
    progress: ProgressCalculator<P>,
    config: MaintenanceConfig,
}

impl<P, C, R> JobInstanceProcessor<P, C, R>
where
    P: JobPersistence + Clone,
    C: WorkChannel<JobWorkNotification>,
    R: ReductionStepExecutor,
{
    pub fn new(
        persistence: P,
        channel: C,
        registry: Arc<JobDefinitionRegistry>,
        reduction: R,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            progress: ProgressCalculator::new(persistence.clone()),
            persistence,
            channel,
            registry,
            reduction,
            config,
        }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Run one pass over every stored instance.
    ///
    /// A failing instance is logged and does not stop the others. Only a failure to
    /// list the instances is returned.
    pub fn process_all(&self) -> Result<PassSummary, PersistenceError> {
        let mut summary = PassSummary::default();
        for instance_id in self.persistence.fetch_instance_ids()? {
            summary.processed += 1;
            if let Err(e) = self.process(&instance_id) {
                summary.failed += 1;
                warn!(instance_id = %instance_id, error = %e, "maintenance pass failed");
            }
        }
        Ok(summary)
    }

    /// Run one maintenance pass for `instance_id`.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub fn process(&self, instance_id: &InstanceId) -> Result<(), ProcessError> {
        let Some(mut instance) = self.persistence.fetch_instance(instance_id)? else {
            debug!("job instance not found; assuming purged");
            return Ok(());
        };

        if instance.pending_cancellation_request && self.cancel(instance_id)? {
            match self.persistence.fetch_instance(instance_id)? {
                Some(fresh) => instance = fresh,
                None => return Ok(()),
            }
        }

        let definition = self.registry.resolve(&instance)?;

        self.enqueue_ready_chunks(instance_id, &definition)?;

        if self.cleanup(&instance, &definition)? == Cleanup::Halt {
            return Ok(());
        }

        if definition.is_gated_execution() {
            self.trigger_gated_executions(instance_id, &definition)?;
        }
        Ok(())
    }

    fn cancel(&self, instance_id: &InstanceId) -> Result<bool, ProcessError> {
        let cancelled = self.persistence.update_instance(instance_id, &mut |row| {
            if row.is_finished() {
                return false;
            }
            let message = cancellation_message(row.current_gated_step_id.as_ref());
            if !row.update_status(InstanceStatus::Cancelled) {
                return false;
            }
            row.error_message = Some(message);
            true
        })?;

        if cancelled {
            info!(instance_id = %instance_id, "job instance cancelled");
        }
        Ok(cancelled)
    }

    /// Claim every dispatchable READY chunk and announce it on the work channel.
    fn enqueue_ready_chunks(
        &self,
        instance_id: &InstanceId,
        definition: &Arc<JobDefinition>,
    ) -> Result<usize, ProcessError> {
        let mut queued = 0;
        for chunk in self.persistence.fetch_ready_chunks(instance_id)? {
            let cursor = WorkCursor::for_step(definition, &chunk.target_step_id)?;
            match cursor.dispatch_route() {
                DispatchRoute::Transport => {}
                DispatchRoute::GateDeferred | DispatchRoute::Inline => continue,
            }

            if self.persistence.claim_chunk(&chunk.id)? != 1 {
                warn!(
                    instance_id = %instance_id,
                    chunk_id = %chunk.id,
                    "work chunk already claimed or gone; skipping"
                );
                continue;
            }

            let notification = JobWorkNotification::new(
                definition.id(),
                definition.version(),
                instance_id.clone(),
                chunk.target_step_id,
                chunk.id,
            );
            self.channel
                .publish(notification)
                .map_err(|e| ProcessError::Transport(format!("{e:?}")))?;
            queued += 1;
        }

        if queued > 0 {
            debug!(instance_id = %instance_id, queued, "work chunks queued");
        }
        Ok(queued)
    }

    fn cleanup(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
    ) -> Result<Cleanup, ProcessError> {
        let instance_id = &instance.instance_id;
        match instance.status {
            InstanceStatus::Queued => {}
            InstanceStatus::Finalize => return Ok(Cleanup::Halt),
            InstanceStatus::InProgress | InstanceStatus::Errored => {
                self.progress.recompute(instance_id, definition)?;
            }
            InstanceStatus::Completed | InstanceStatus::Failed => {
                if self.purge_expired_instance(instance)? {
                    return Ok(Cleanup::Halt);
                }
            }
            InstanceStatus::Cancelled => {
                self.purge_expired_instance(instance)?;
                return Ok(Cleanup::Halt);
            }
        }

        if instance.is_finished() && !instance.work_chunks_purged {
            self.persistence.purge_chunks(instance_id)?;
            info!(instance_id = %instance_id, status = %instance.status, "work chunks purged");
        }
        Ok(Cleanup::Proceed)
    }

    fn purge_expired_instance(&self, instance: &JobInstance) -> Result<bool, ProcessError> {
        if !self.is_expired(instance) {
            return Ok(false);
        }
        self.persistence
            .purge_instance_and_chunks(&instance.instance_id)?;
        info!(
            instance_id = %instance.instance_id,
            status = %instance.status,
            "expired job instance purged"
        );
        Ok(true)
    }

    /// Ended longer ago than the purge retention.
    fn is_expired(&self, instance: &JobInstance) -> bool {
        let Some(end_time) = instance.end_time else {
            return false;
        };
        chrono::Duration::from_std(self.config.purge_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .is_some_and(|cutoff| end_time < cutoff)
    }

    fn trigger_gated_executions(
        &self,
        instance_id: &InstanceId,
        definition: &Arc<JobDefinition>,
    ) -> Result<(), ProcessError> {
        let Some(instance) = self.persistence.fetch_instance(instance_id)? else {
            return Ok(());
        };
        if !instance.is_running() {
            return Ok(());
        }
        let Some(step_id) = instance.current_gated_step_id else {
            return Ok(());
        };

        let cursor = WorkCursor::for_step(definition, &step_id)?;
        let statuses = self
            .persistence
            .distinct_chunk_statuses(instance_id, &step_id)?;
        let decision = GateDecision::evaluate(&statuses);
        if !decision.can_advance() {
            debug!(step_id = %step_id, ?statuses, "gate closed");
            return Ok(());
        }

        match cursor.position() {
            StepPosition::FinalReduction => {
                info!(step_id = %step_id, ?decision, "triggering reduction step");
                self.reduction.trigger_reduction_step(instance_id, &cursor)?;
            }
            StepPosition::Intermediate { next } => {
                let next_id = next.id().clone();
                if self.advance_gate(instance_id, &step_id, &next_id)? {
                    info!(from = %step_id, to = %next_id, ?decision, "gated step advanced");
                    self.enqueue_ready_chunks(instance_id, definition)?;
                } else {
                    info!(from = %step_id, to = %next_id, "gated step already advanced; leaving it");
                }
            }
            StepPosition::Final => {
                debug!(step_id = %step_id, "final gated step; nothing to advance");
            }
        }
        Ok(())
    }

    /// Move the pointer from exactly `from` to `to`.
    fn advance_gate(
        &self,
        instance_id: &InstanceId,
        from: &StepId,
        to: &StepId,
    ) -> Result<bool, ProcessError> {
        Ok(self.persistence.update_instance(instance_id, &mut |row| {
            if row.current_gated_step_id.as_ref() != Some(from) {
                return false;
            }
            row.current_gated_step_id = Some(to.clone());
            true
        })?)
    }
}

fn cancellation_message(current_step: Option<&StepId>) -> String {
    match current_step {
        Some(step_id) => format!("Job instance cancelled while running step {step_id}"),
        None => "Job instance cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_message_names_gated_step() {
        assert_eq!(cancellation_message(None), "Job instance cancelled");
        assert_eq!(
            cancellation_message(Some(&StepId::from("generate"))),
            "Job instance cancelled while running step generate"
        );
    }
}
