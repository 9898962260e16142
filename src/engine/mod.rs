//! Execution engine: the drain loop and the task runner it drives.

pub mod executor;
pub mod scheduler;

pub use executor::{CommandRunner, RunnerConfig, TaskOutcome, TaskRequest, TaskRunner};
pub use scheduler::{CRASH_ERROR, RunReport, Scheduler};
