//! stagecoach - a self-hosted CI/CD pipeline runner

pub mod artifact;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod remote;

// Re-export commonly used types
pub use artifact::{ArtifactStore, LocalArtifactStore};
pub use core::{ExecutionStatus, Pipeline, PipelineContext, Stage, Step, StepAction};
pub use execution::{ExecutionEngine, ExecutionEvent, StepExecutor, StepRunner};
pub use remote::{Connection, RemoteExecutor, SshClient};
