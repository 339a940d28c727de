//! Progress recomputation for running instances.

use tracing::{debug, info};

use stepgate_core::{InstanceId, InstanceProgress, InstanceStatus, JobDefinition, JobInstance};

use crate::persistence::{JobPersistence, PersistenceError};

/// Recomputes an instance's progress, error count and derived status from its chunks.
#[derive(Debug, Clone)]
pub struct ProgressCalculator<P> {
    persistence: P,
}

impl<P: JobPersistence> ProgressCalculator<P> {
    pub fn new(persistence: P) -> Self {
        Self { persistence }
    }

    /// Recompute and conditionally persist. Returns whether the row changed.
    pub fn recompute(
        &self,
        instance_id: &InstanceId,
        definition: &JobDefinition,
    ) -> Result<bool, PersistenceError> {
        let chunks = self.persistence.fetch_all_chunks(instance_id)?;
        let progress = InstanceProgress::from_statuses(chunks.iter().map(|c| c.status));

        let mut derived = None;
        let changed = self.persistence.update_instance(instance_id, &mut |row| {
            // Anything else belongs to another owner by now.
            if !matches!(row.status, InstanceStatus::InProgress | InstanceStatus::Errored) {
                return false;
            }
            let allowed = completion_allowed(definition, row);
            let changed = progress.apply_to(row, allowed);
            derived = Some(row.status);
            changed
        })?;

        match (changed, derived) {
            (true, Some(status)) => info!(
                instance_id = %instance_id,
                status = %status,
                total = progress.total(),
                completed = progress.completed,
                errors = progress.error_count(),
                "job instance progress updated"
            ),
            _ => debug!(instance_id = %instance_id, total = progress.total(), "job instance progress unchanged"),
        }
        Ok(changed)
    }
}

/// Whether chunk counts alone may complete the instance.
///
/// Gated jobs complete only from their final step, and never from a reduction
/// step: that completion belongs to the reduction executor.
pub fn completion_allowed(definition: &JobDefinition, instance: &JobInstance) -> bool {
    if !definition.is_gated_execution() {
        return true;
    }
    instance
        .current_gated_step_id
        .as_ref()
        .and_then(|step_id| definition.step(step_id))
        .is_some_and(|step| step.is_final() && !step.is_reduction())
}
