//! Work cursor: a step's position and kind within a job definition.

use std::sync::Arc;

use crate::definition::{JobDefinition, StepDefinition, StepKind};
use crate::error::{DomainError, DomainResult};
use crate::id::StepId;

/// Where a step sits in its job, as seen by gate advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPosition<'a> {
    /// Not the last step; advancing moves the gate to `next`.
    Intermediate { next: &'a StepDefinition },
    /// Last step, run by ordinary workers. Nothing left to advance to.
    Final,
    /// Last step, run inline by the reduction executor.
    FinalReduction,
}

/// How READY chunks targeting a step leave the READY state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    /// Claim and announce on the work channel.
    Transport,
    /// The job is gated; release belongs to gate advancement.
    GateDeferred,
    /// Reduction input; consumed by the reduction executor, never announced.
    Inline,
}

/// Stateless lookup of one step within a job definition.
#[derive(Debug, Clone)]
pub struct WorkCursor {
    definition: Arc<JobDefinition>,
    index: usize,
}

impl WorkCursor {
    pub fn for_step(definition: &Arc<JobDefinition>, step_id: &StepId) -> DomainResult<Self> {
        let index = definition
            .step_index(step_id)
            .ok_or_else(|| DomainError::unknown_step(definition.id(), step_id.as_str()))?;
        Ok(Self {
            definition: Arc::clone(definition),
            index,
        })
    }

    pub fn first_step(definition: &Arc<JobDefinition>) -> Self {
        Self {
            definition: Arc::clone(definition),
            index: 0,
        }
    }

    pub fn job_definition(&self) -> &Arc<JobDefinition> {
        &self.definition
    }

    pub fn current_step(&self) -> &StepDefinition {
        &self.definition.steps()[self.index]
    }

    pub fn current_step_id(&self) -> &StepId {
        self.current_step().id()
    }

    pub fn next_step(&self) -> Option<&StepDefinition> {
        self.definition.steps().get(self.index + 1)
    }

    pub fn is_first_step(&self) -> bool {
        self.index == 0
    }

    pub fn is_final_step(&self) -> bool {
        self.current_step().is_final()
    }

    pub fn is_reduction_step(&self) -> bool {
        self.current_step().is_reduction()
    }

    pub fn position(&self) -> StepPosition<'_> {
        let kind = self.current_step().kind();
        match (kind.contains(StepKind::FINAL), self.next_step()) {
            (false, Some(next)) => StepPosition::Intermediate { next },
            _ if kind.contains(StepKind::REDUCTION) => StepPosition::FinalReduction,
            _ => StepPosition::Final,
        }
    }

    pub fn dispatch_route(&self) -> DispatchRoute {
        if self.is_reduction_step() {
            DispatchRoute::Inline
        } else if self.definition.is_gated_execution() {
            DispatchRoute::GateDeferred
        } else {
            DispatchRoute::Transport
        }
    }
}
