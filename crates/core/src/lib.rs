//! `stepgate-core` — batch job state model.
//!
//! This crate contains **pure domain** primitives for the maintenance core:
//! instances, chunks, job definitions, the work cursor, the gate rule and progress
//! derivation. No storage or transport concerns.

pub mod chunk;
pub mod cursor;
pub mod definition;
pub mod error;
pub mod gate;
pub mod id;
pub mod instance;
pub mod progress;
pub mod version;

pub use chunk::{WorkChunk, WorkChunkStatus};
pub use cursor::{DispatchRoute, StepPosition, WorkCursor};
pub use definition::{JobDefinition, JobDefinitionBuilder, StepDefinition, StepKind};
pub use error::{DomainError, DomainResult};
pub use gate::GateDecision;
pub use id::{ChunkId, InstanceId, StepId};
pub use instance::{InstanceStatus, JobInstance};
pub use progress::InstanceProgress;
pub use version::ExpectedVersion;
