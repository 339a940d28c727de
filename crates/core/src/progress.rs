//! Aggregate progress derived from chunk states.

use serde::{Deserialize, Serialize};

use crate::chunk::WorkChunkStatus;
use crate::instance::{InstanceStatus, JobInstance};

/// Chunk counts for one instance, by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProgress {
    pub ready: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub errored: usize,
    pub failed: usize,
}

impl InstanceProgress {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = WorkChunkStatus>,
    {
        let mut progress = Self::default();
        for status in statuses {
            match status {
                WorkChunkStatus::Ready => progress.ready += 1,
                WorkChunkStatus::Queued => progress.queued += 1,
                WorkChunkStatus::InProgress => progress.in_progress += 1,
                WorkChunkStatus::Completed => progress.completed += 1,
                WorkChunkStatus::Errored => progress.errored += 1,
                WorkChunkStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }

    pub fn total(&self) -> usize {
        self.ready + self.queued + self.in_progress + self.completed + self.errored + self.failed
    }

    pub fn incomplete(&self) -> usize {
        self.ready + self.queued + self.in_progress + self.errored
    }

    pub fn error_count(&self) -> u32 {
        u32::try_from(self.errored + self.failed).unwrap_or(u32::MAX)
    }

    pub fn fraction_complete(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.completed as f64 / total as f64,
        }
    }

    /// Status the chunk counts call for.
    ///
    /// `completion_allowed` is false while a gated job still has steps ahead of it,
    /// or when completion belongs to the reduction executor.
    pub fn derived_status(&self, completion_allowed: bool) -> InstanceStatus {
        if self.failed > 0 {
            InstanceStatus::Failed
        } else if self.incomplete() == 0 && self.total() > 0 && completion_allowed {
            InstanceStatus::Completed
        } else if self.errored > 0 {
            InstanceStatus::Errored
        } else {
            InstanceStatus::InProgress
        }
    }

    /// Write the counts into `instance`. Returns whether anything changed.
    pub fn apply_to(&self, instance: &mut JobInstance, completion_allowed: bool) -> bool {
        let mut changed = false;

        let fraction = self.fraction_complete();
        if (instance.progress - fraction).abs() > f64::EPSILON {
            instance.progress = fraction;
            changed = true;
        }

        let error_count = self.error_count();
        if instance.error_count != error_count {
            instance.error_count = error_count;
            changed = true;
        }

        let next = self.derived_status(completion_allowed);
        if next != instance.status && instance.update_status(next) {
            if next == InstanceStatus::Failed && instance.error_message.is_none() {
                instance.error_message = Some(format!("{} work chunk(s) failed", self.failed));
            }
            changed = true;
        }

        changed
    }
}
