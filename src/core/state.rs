//! Execution state models

use crate::artifact::ArtifactSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Every stage that ran succeeded
    Completed,
    /// At least one stage failed
    Failed,
    /// Run was interrupted before all stages finished
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ExecutionStatus::Pending),
            "Running" => Ok(ExecutionStatus::Running),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("Unknown execution status: {}", other)),
        }
    }
}

/// Final result of a stage, as seen by the conditions of later stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageResult {
    Succeeded,
    Failed,
    Skipped,
}

/// State of a single stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageState {
    /// Stage is waiting for its dependencies
    Pending,
    /// Stage is currently running
    Running {
        started_at: DateTime<Utc>,
    },
    /// Every job in the stage succeeded
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// A job in the stage failed
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Stage never ran (condition false, or run cancelled)
    Skipped {
        reason: String,
    },
}

impl StageState {
    /// Check if stage is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded { .. } | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }

    /// The result of a finished stage, `None` while it is pending or running
    pub fn result(&self) -> Option<StageResult> {
        match self {
            StageState::Succeeded { .. } => Some(StageResult::Succeeded),
            StageState::Failed { .. } => Some(StageResult::Failed),
            StageState::Skipped { .. } => Some(StageResult::Skipped),
            StageState::Pending | StageState::Running { .. } => None,
        }
    }
}

/// Outcome of a single step (after all of its attempts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step display name
    pub name: String,

    /// Kind of action the step performed ("script", "publish", ...)
    pub kind: String,

    /// Whether the step succeeded
    pub success: bool,

    /// Failure was ignored because of `continue_on_error`
    #[serde(default)]
    pub tolerated: bool,

    /// Process exit code, if a process ran
    pub exit_code: Option<i32>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Error description when the step failed
    pub error: Option<String>,

    /// Number of attempts made
    pub attempts: u32,

    /// Wall-clock time of the last attempt
    pub duration_ms: u64,

    /// Artifact published or downloaded by the step
    #[serde(default)]
    pub artifact: Option<ArtifactSummary>,
}

impl StepOutcome {
    /// A successful outcome with no process output yet
    pub fn succeeded(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            success: true,
            tolerated: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            attempts: 1,
            duration_ms: 0,
            artifact: None,
        }
    }

    /// A failed outcome carrying an error message
    pub fn failed(name: &str, kind: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::succeeded(name, kind)
        }
    }

    /// Combined stdout and stderr, as shown to users
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", "") => String::new(),
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// Outcome of a job: the outcomes of the steps it ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub duration_ms: u64,
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When execution completed/failed
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of stages
    pub total_stages: usize,

    /// Number of succeeded stages
    pub succeeded_stages: usize,

    /// Number of failed stages
    pub failed_stages: usize,

    /// Number of skipped stages
    pub skipped_stages: usize,
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_stages: 0,
            succeeded_stages: 0,
            failed_stages: 0,
            skipped_stages: 0,
        }
    }

    /// Mark pipeline as started
    pub fn start(&mut self, total_stages: usize) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_stages = total_stages;
    }

    /// Mark pipeline as completed
    pub fn complete(&mut self) {
        self.finish(ExecutionStatus::Completed);
    }

    /// Mark pipeline as failed
    pub fn fail(&mut self) {
        self.finish(ExecutionStatus::Failed);
    }

    /// Mark pipeline as cancelled
    pub fn cancel(&mut self) {
        self.finish(ExecutionStatus::Cancelled);
    }

    fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Update stage counts
    pub fn update_counts(&mut self, succeeded: usize, failed: usize, skipped: usize) {
        self.succeeded_stages = succeeded;
        self.failed_stages = failed;
        self.skipped_stages = skipped;
    }

    /// Calculate progress percentage (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        (self.succeeded_stages + self.failed_stages + self.skipped_stages) as f64
            / self.total_stages as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
