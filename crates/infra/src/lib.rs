//! Infrastructure layer: persistence, definition registry, reduction, maintenance passes.

pub mod config;
pub mod maintenance;
pub mod persistence;
pub mod progress;
pub mod reduction;
pub mod registry;


pub use config::{ConfigError, MaintenanceConfig};
pub use maintenance::{
    JobInstanceProcessor, MaintenanceRunner, MaintenanceRunnerHandle, PassSummary, ProcessError,
    RunnerStats,
};
pub use persistence::{InMemoryJobPersistence, JobPersistence, PersistenceError};
pub use progress::ProgressCalculator;
pub use reduction::{LocalReductionExecutor, Reducer, ReductionError, ReductionStepExecutor};
pub use registry::{JobDefinitionRegistry, RegistryError};
