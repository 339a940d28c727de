//! Job instances and the legal status-transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::definition::JobDefinition;
use crate::error::DomainError;
use crate::id::{InstanceId, StepId};

/// Job instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Submitted, nothing has started yet.
    Queued,
    /// At least one chunk has been picked up.
    InProgress,
    /// The reduction step is running; the reduction executor owns completion.
    Finalize,
    /// Some chunks failed with retriable errors.
    Errored,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 7] = [
        InstanceStatus::Queued,
        InstanceStatus::InProgress,
        InstanceStatus::Finalize,
        InstanceStatus::Errored,
        InstanceStatus::Completed,
        InstanceStatus::Failed,
        InstanceStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Queued => "QUEUED",
            InstanceStatus::InProgress => "IN_PROGRESS",
            InstanceStatus::Finalize => "FINALIZE",
            InstanceStatus::Errored => "ERRORED",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses: the instance will never run again.
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Legal transition table. A status never transitions to itself.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if self == next {
            return false;
        }

        match self {
            Queued => true,
            InProgress | Errored => next != Queued,
            Finalize => !matches!(next, Queued | InProgress),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl core::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InstanceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown instance status: {s}")))
    }
}

/// One execution of a job definition.
///
/// Instances are never written back blindly: every change goes through a
/// conditional update against the persisted row, checked by `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: InstanceId,
    pub job_definition_id: String,
    pub job_definition_version: u32,
    pub status: InstanceStatus,
    /// Present only for gated job definitions.
    pub current_gated_step_id: Option<StepId>,
    /// Set by an external actor, consumed by the next maintenance pass.
    pub pending_cancellation_request: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub work_chunks_purged: bool,
    /// Fraction of chunks completed, 0.0..=1.0.
    pub progress: f64,
    pub error_count: u32,
    /// Output of the reduction step, if the job has one.
    pub report: Option<String>,
    /// Row version; bumped by every successful conditional write.
    pub version: u64,
}

impl JobInstance {
    /// Create a `Queued` instance for the given definition.
    pub fn new(definition: &JobDefinition) -> Self {
        let current_gated_step_id = if definition.is_gated_execution() {
            Some(definition.first_step().id().clone())
        } else {
            None
        };

        Self {
            instance_id: InstanceId::new(),
            job_definition_id: definition.id().to_string(),
            job_definition_version: definition.version(),
            status: InstanceStatus::Queued,
            current_gated_step_id,
            pending_cancellation_request: false,
            error_message: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            work_chunks_purged: false,
            progress: 0.0,
            error_count: 0,
            report: None,
            version: 0,
        }
    }

    pub fn with_id(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn has_gated_step(&self) -> bool {
        self.current_gated_step_id.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_ended()
    }

    /// Running instances are eligible for gate advancement.
    pub fn is_running(&self) -> bool {
        if self.pending_cancellation_request {
            return false;
        }
        matches!(
            self.status,
            InstanceStatus::InProgress | InstanceStatus::Errored | InstanceStatus::Finalize
        )
    }

    /// Move the instance to `next` if the transition table allows it.
    ///
    /// Returns `false` and leaves the instance untouched when `next` is the current
    /// status or the transition is illegal. Stamps `start_time` on the first entry
    /// into `InProgress` and `end_time` on the first entry into an ended status.
    pub fn update_status(&mut self, next: InstanceStatus) -> bool {
        if self.status == next {
            return false;
        }

        if !self.status.can_transition_to(next) {
            warn!(
                instance_id = %self.instance_id,
                from = %self.status,
                to = %next,
                "refusing illegal job instance status transition"
            );
            return false;
        }

        let now = Utc::now();
        if next == InstanceStatus::InProgress && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if next.is_ended() && self.end_time.is_none() {
            self.end_time = Some(now);
        }
        self.status = next;
        true
    }
}
