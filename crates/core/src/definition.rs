//! Job definitions: an ordered list of steps, each tagged with its kinds.

use std::collections::HashSet;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::StepId;

/// Composable set of step kinds.
///
/// Kinds are not mutually exclusive: the last step of a gated job that aggregates
/// its inputs is `GATED | REDUCTION | FINAL`. `NORMAL` is the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKind(u8);

impl StepKind {
    pub const NORMAL: StepKind = StepKind(0);
    pub const GATED: StepKind = StepKind(1);
    pub const REDUCTION: StepKind = StepKind(1 << 1);
    pub const FINAL: StepKind = StepKind(1 << 2);

    const NAMED: [(StepKind, &'static str); 3] = [
        (StepKind::GATED, "gated"),
        (StepKind::REDUCTION, "reduction"),
        (StepKind::FINAL, "final"),
    ];

    pub const fn contains(self, other: StepKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: StepKind) -> StepKind {
        StepKind(self.0 | other.0)
    }

    pub const fn is_normal(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for StepKind {
    type Output = StepKind;

    fn bitor(self, rhs: StepKind) -> StepKind {
        self.union(rhs)
    }
}

impl core::fmt::Display for StepKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_normal() {
            return f.write_str("normal");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// One step of a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    id: StepId,
    kind: StepKind,
}

impl StepDefinition {
    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn is_reduction(&self) -> bool {
        self.kind.contains(StepKind::REDUCTION)
    }

    pub fn is_final(&self) -> bool {
        self.kind.contains(StepKind::FINAL)
    }
}

/// Immutable description of a multi-step job.
///
/// Deserialization goes through [`JobDefinitionBuilder::build`], so a decoded
/// definition carries the same guarantees as a built one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJobDefinition")]
pub struct JobDefinition {
    id: String,
    version: u32,
    gated_execution: bool,
    steps: Vec<StepDefinition>,
}

impl JobDefinition {
    pub fn builder(id: impl Into<String>, version: u32) -> JobDefinitionBuilder {
        JobDefinitionBuilder {
            id: id.into(),
            version,
            gated_execution: false,
            steps: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Gated jobs finish producing every chunk of step N before step N+1 starts.
    pub fn is_gated_execution(&self) -> bool {
        self.gated_execution
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn first_step(&self) -> &StepDefinition {
        // `build()` guarantees at least one step.
        &self.steps[0]
    }

    pub fn step_index(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id() == step_id)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id() == step_id)
    }
}

#[derive(Deserialize)]
struct RawJobDefinition {
    id: String,
    version: u32,
    #[serde(default)]
    gated_execution: bool,
    steps: Vec<StepDefinition>,
}

impl TryFrom<RawJobDefinition> for JobDefinition {
    type Error = DomainError;

    fn try_from(raw: RawJobDefinition) -> DomainResult<Self> {
        let mut builder = JobDefinition::builder(raw.id, raw.version);
        if raw.gated_execution {
            builder = builder.gated_execution();
        }
        for step in raw.steps {
            builder = if step.is_reduction() {
                builder.add_reduction_step(step.id)
            } else {
                builder.add_step(step.id)
            };
        }
        builder.build()
    }
}

/// Builder for [`JobDefinition`]; kinds are assigned at `build()` time.
#[derive(Debug, Clone)]
pub struct JobDefinitionBuilder {
    id: String,
    version: u32,
    gated_execution: bool,
    steps: Vec<(StepId, bool)>,
}

impl JobDefinitionBuilder {
    pub fn gated_execution(mut self) -> Self {
        self.gated_execution = true;
        self
    }

    pub fn add_step(mut self, step_id: impl Into<StepId>) -> Self {
        self.steps.push((step_id.into(), false));
        self
    }

    /// Add the terminal reduction step. It must be the last step added.
    pub fn add_reduction_step(mut self, step_id: impl Into<StepId>) -> Self {
        self.steps.push((step_id.into(), true));
        self
    }

    pub fn build(self) -> DomainResult<JobDefinition> {
        if self.id.trim().is_empty() {
            return Err(DomainError::validation("job definition id must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(DomainError::validation(format!(
                "job definition {} has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for (step_id, _) in &self.steps {
            if step_id.as_str().trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "job definition {} has a step with an empty id",
                    self.id
                )));
            }
            if !seen.insert(step_id.clone()) {
                return Err(DomainError::validation(format!(
                    "job definition {} declares step {} twice",
                    self.id, step_id
                )));
            }
        }

        let last = self.steps.len() - 1;
        let mut steps = Vec::with_capacity(self.steps.len());
        for (idx, (step_id, reduction)) in self.steps.into_iter().enumerate() {
            let mut kind = StepKind::NORMAL;
            if self.gated_execution {
                kind = kind | StepKind::GATED;
            }
            if reduction {
                if idx != last {
                    return Err(DomainError::validation(format!(
                        "reduction step {step_id} of job definition {} must be the final step",
                        self.id
                    )));
                }
                if !self.gated_execution {
                    return Err(DomainError::validation(format!(
                        "reduction step {step_id} requires gated execution in job definition {}",
                        self.id
                    )));
                }
                kind = kind | StepKind::REDUCTION;
            }
            if idx == last {
                kind = kind | StepKind::FINAL;
            }
            steps.push(StepDefinition { id: step_id, kind });
        }

        Ok(JobDefinition {
            id: self.id,
            version: self.version,
            gated_execution: self.gated_execution,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_assigned_at_build_time() {
        let definition = JobDefinition::builder("bulk-reindex", 1)
            .gated_execution()
            .add_step("load-ids")
            .add_step("reindex")
            .add_reduction_step("report")
            .build()
            .unwrap();

        let kinds: Vec<_> = definition.steps().iter().map(|s| s.kind()).collect();
        assert_eq!(kinds[0], StepKind::GATED);
        assert_eq!(kinds[1], StepKind::GATED);
        assert_eq!(
            kinds[2],
            StepKind::GATED | StepKind::REDUCTION | StepKind::FINAL
        );
        assert_eq!(kinds[2].to_string(), "gated|reduction|final");
    }

    #[test]
    fn plain_steps_are_normal_until_the_last() {
        let definition = JobDefinition::builder("bulk-delete", 1)
            .add_step("find")
            .add_step("delete")
            .build()
            .unwrap();

        assert!(definition.steps()[0].kind().is_normal());
        assert_eq!(definition.steps()[0].kind().to_string(), "normal");
        assert!(definition.steps()[1].is_final());
        assert!(!definition.is_gated_execution());
    }

    #[test]
    fn reduction_must_be_last_and_gated() {
        let err = JobDefinition::builder("x", 1)
            .gated_execution()
            .add_reduction_step("reduce")
            .add_step("after")
            .build()
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("must be the final step")));

        let err = JobDefinition::builder("x", 1)
            .add_step("a")
            .add_reduction_step("reduce")
            .build()
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("requires gated execution")));
    }

    #[test]
    fn duplicate_and_missing_steps_are_rejected() {
        assert!(JobDefinition::builder("x", 1).build().is_err());
        assert!(
            JobDefinition::builder("x", 1)
                .add_step("a")
                .add_step("a")
                .build()
                .is_err()
        );
        assert!(JobDefinition::builder(" ", 1).add_step("a").build().is_err());
    }

    #[test]
    fn deserialization_validates_like_build() {
        let definition = JobDefinition::builder("bulk-export", 3)
            .gated_execution()
            .add_step("generate")
            .add_reduction_step("report")
            .build()
            .unwrap();
        let json = serde_json::to_string(&definition).unwrap();
        let decoded: JobDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, definition);

        let empty = r#"{"id":"bulk-export","version":1,"gated_execution":false,"steps":[]}"#;
        assert!(serde_json::from_str::<JobDefinition>(empty).is_err());

        // Reduction without gated execution is rejected on decode too.
        let ungated = r#"{"id":"x","version":1,"steps":[{"id":"reduce","kind":6}]}"#;
        assert!(serde_json::from_str::<JobDefinition>(ungated).is_err());
    }
}
