//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures of the batch state model (malformed definitions,
/// unknown steps, invalid ids). Storage and transport failures live
/// in the infrastructure crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed job definition).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A step id is not part of the job definition.
    #[error("unknown step '{step_id}' in job definition {definition_id}")]
    UnknownStep {
        definition_id: String,
        step_id: String,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_step(definition_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self::UnknownStep {
            definition_id: definition_id.into(),
            step_id: step_id.into(),
        }
    }
}
