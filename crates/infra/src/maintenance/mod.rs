//! Maintenance passes: the per-instance orchestrator and its background driver.

pub mod processor;
pub mod runner;

pub use processor::{JobInstanceProcessor, PassSummary, ProcessError};
pub use runner::{MaintenanceRunner, MaintenanceRunnerHandle, RunnerStats};
