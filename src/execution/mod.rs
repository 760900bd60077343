//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod runner;
pub mod scheduler;

pub use engine::{EventHandler, ExecutionEngine, ExecutionError, ExecutionEvent};
pub use executor::StepExecutor;
pub use runner::{ProcessOutput, RunnerConfig, RunnerError, StepRunner};
pub use scheduler::{ScheduleDecision, StageScheduler};
