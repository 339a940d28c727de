//! Work chunks: the smallest addressable unit of work for one step of one instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ChunkId, InstanceId, StepId};

/// Work chunk lifecycle status.
///
/// Chunks only move forward: `Ready -> Queued -> InProgress -> {Completed | Errored | Failed}`.
/// An errored chunk may be picked up again by a worker (`Errored -> InProgress`) or
/// given up on (`Errored -> Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkChunkStatus {
    /// Produced and waiting to be dispatched.
    Ready,
    /// Claimed by a maintenance pass and announced to workers.
    Queued,
    /// Picked up by a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed with a retriable error.
    Errored,
    /// Failed permanently.
    Failed,
}

impl WorkChunkStatus {
    pub const ALL: [WorkChunkStatus; 6] = [
        WorkChunkStatus::Ready,
        WorkChunkStatus::Queued,
        WorkChunkStatus::InProgress,
        WorkChunkStatus::Completed,
        WorkChunkStatus::Errored,
        WorkChunkStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkChunkStatus::Ready => "READY",
            WorkChunkStatus::Queued => "QUEUED",
            WorkChunkStatus::InProgress => "IN_PROGRESS",
            WorkChunkStatus::Completed => "COMPLETED",
            WorkChunkStatus::Errored => "ERRORED",
            WorkChunkStatus::Failed => "FAILED",
        }
    }

    /// Whether a chunk still has work ahead of it.
    pub fn is_incomplete(self) -> bool {
        matches!(
            self,
            WorkChunkStatus::Ready
                | WorkChunkStatus::Queued
                | WorkChunkStatus::InProgress
                | WorkChunkStatus::Errored
        )
    }

    pub fn can_transition_to(self, next: WorkChunkStatus) -> bool {
        use WorkChunkStatus::*;
        matches!(
            (self, next),
            (Ready, Queued)
                | (Queued, InProgress)
                | (InProgress, Completed)
                | (InProgress, Errored)
                | (InProgress, Failed)
                | (Errored, InProgress)
                | (Errored, Failed)
        )
    }
}

impl core::fmt::Display for WorkChunkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for WorkChunkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkChunkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown work chunk status: {s}")))
    }
}

/// One unit of input/output data for one step of one job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkChunk {
    pub id: ChunkId,
    pub instance_id: InstanceId,
    pub target_step_id: StepId,
    /// Position of the chunk among the chunks of its step.
    pub sequence: u32,
    pub status: WorkChunkStatus,
    /// Step input produced by the previous step.
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkChunk {
    /// Create a chunk in `Ready` state.
    pub fn ready(
        instance_id: InstanceId,
        target_step_id: StepId,
        sequence: u32,
        data: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ChunkId::new(),
            instance_id,
            target_step_id,
            sequence,
            status: WorkChunkStatus::Ready,
            data,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_chunks_start_ready() {
        let chunk = WorkChunk::ready(InstanceId::from("i"), StepId::from("a"), 0, None);
        assert_eq!(chunk.status, WorkChunkStatus::Ready);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in WorkChunkStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkChunkStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<WorkChunkStatus>().is_err());
    }

    #[test]
    fn claim_is_the_only_way_out_of_ready() {
        let targets: Vec<_> = WorkChunkStatus::ALL
            .into_iter()
            .filter(|s| WorkChunkStatus::Ready.can_transition_to(*s))
            .collect();
        assert_eq!(targets, vec![WorkChunkStatus::Queued]);
    }

    fn any_status() -> impl Strategy<Value = WorkChunkStatus> {
        prop::sample::select(WorkChunkStatus::ALL.to_vec())
    }

    proptest! {
        /// Property: no legal transition ever leads back to `Ready` or out of `Completed`/`Failed`.
        #[test]
        fn chunks_never_move_backward(from in any_status(), to in any_status()) {
            if from.can_transition_to(to) {
                prop_assert_ne!(to, WorkChunkStatus::Ready);
                prop_assert_ne!(from, WorkChunkStatus::Completed);
                prop_assert_ne!(from, WorkChunkStatus::Failed);
                prop_assert_ne!(from, to);
            }
        }
    }
}
