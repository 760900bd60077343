//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{ExecutionStatus, Job, JobOutcome, Pipeline, PipelineContext, StageState, Step, StepOutcome},
    execution::{ScheduleDecision, StageScheduler, StepExecutor},
    remote::RemoteExecutor,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Error recorded on the job that was running when the run was cancelled
const CANCELLED: &str = "Cancelled";

/// How often a running step checks the cancellation flag
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        total_stages: usize,
    },
    StageStarted {
        stage_id: String,
    },
    StageSkipped {
        stage_id: String,
        reason: String,
    },
    StageCompleted {
        stage_id: String,
        duration_ms: u64,
    },
    StageFailed {
        stage_id: String,
        error: String,
    },
    JobStarted {
        stage_id: String,
        job_id: String,
    },
    JobCompleted {
        stage_id: String,
        job_id: String,
        success: bool,
        duration_ms: u64,
    },
    StepStarted {
        stage_id: String,
        job_id: String,
        step_name: String,
        kind: &'static str,
        attempt: u32,
    },
    StepOutput {
        step_name: String,
        output: String,
    },
    StepCompleted {
        step_name: String,
        duration_ms: u64,
    },
    StepFailed {
        step_name: String,
        error: String,
        /// Failure ignored because of `continue_on_error`
        tolerated: bool,
    },
    StepRetrying {
        step_name: String,
        attempt: u32,
        max_attempts: u32,
    },
    ArtifactPublished {
        name: String,
        file_count: usize,
        total_size: u64,
    },
    ArtifactDownloaded {
        name: String,
        file_count: usize,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Errors that stop a run before or outside of stage execution
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("branch '{branch}' does not match the pipeline trigger ({patterns})")]
    TriggerRejected { branch: String, patterns: String },

    #[error("pipeline stuck: stages {0} can never run")]
    Stuck(String),

    #[error("stage '{0}' not found")]
    StageNotFound(String),
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    scheduler: StageScheduler,
    executor: Arc<StepExecutor<R>>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
    cancelled: Arc<AtomicBool>,
    enforce_trigger: bool,
}

impl<R: RemoteExecutor + 'static> ExecutionEngine<R> {
    pub fn new(executor: StepExecutor<R>) -> Self {
        Self {
            scheduler: StageScheduler::new(),
            executor: Arc::new(executor),
            event_handlers: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
            enforce_trigger: true,
        }
    }

    /// Share a cancellation flag (e.g. one set by a Ctrl-C handler)
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Run even when the branch does not match the trigger
    pub fn ignore_trigger(mut self, ignore: bool) -> Self {
        self.enforce_trigger = !ignore;
        self
    }

    /// Flag that cancels the run when set
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the cancellation flag is set
    async fn wait_for_cancel(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(CANCEL_POLL).await;
        }
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Execute the entire pipeline
    ///
    /// Stage failures do not produce an error; they are reflected in the
    /// returned status and in the pipeline state.
    pub async fn execute(&self, pipeline: &mut Pipeline) -> Result<ExecutionStatus, ExecutionError> {
        self.check_trigger(pipeline)?;

        let execution_id = pipeline.state.execution_id;
        let total_stages = pipeline.stages.len();

        info!("Starting pipeline execution: {} ({})", pipeline.name, execution_id);
        pipeline.state.start(total_stages);
        self.emit_event(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name: pipeline.name.clone(),
            total_stages,
        })
        .await;

        // Set once cancellation actually cut work short
        let mut interrupted = false;

        // Main execution loop
        while !pipeline.is_complete() {
            if self.is_cancelled() {
                warn!("Pipeline cancelled, skipping remaining stages");
                self.skip_pending(pipeline, "pipeline cancelled").await;
                interrupted = true;
                break;
            }

            match self.scheduler.next(pipeline) {
                Some(ScheduleDecision::Run(stage_id)) => {
                    if self.execute_stage(pipeline, &stage_id).await? {
                        interrupted = true;
                    }
                }
                Some(ScheduleDecision::Skip { stage_id, reason }) => {
                    info!("Skipping stage {}: {}", stage_id, reason);
                    self.mark_stage_skipped(pipeline, &stage_id, reason).await;
                }
                None => {
                    let pending: Vec<&str> = pipeline
                        .stages_in_order()
                        .filter(|s| !s.state.is_terminal())
                        .map(|s| s.id.as_str())
                        .collect();
                    let pending = pending.join(", ");
                    error!("No stage ready to run - pipeline stuck on {}", pending);
                    pipeline.state.fail();
                    self.emit_event(ExecutionEvent::PipelineCompleted {
                        execution_id,
                        status: ExecutionStatus::Failed,
                    })
                    .await;
                    return Err(ExecutionError::Stuck(pending));
                }
            }

            self.update_state_counts(pipeline);
        }

        self.update_state_counts(pipeline);
        let status = if interrupted {
            pipeline.state.cancel();
            ExecutionStatus::Cancelled
        } else if pipeline.state.failed_stages > 0 {
            pipeline.state.fail();
            ExecutionStatus::Failed
        } else {
            pipeline.state.complete();
            ExecutionStatus::Completed
        };

        info!("Pipeline execution finished: {} - {:?}", pipeline.name, status);
        self.emit_event(ExecutionEvent::PipelineCompleted {
            execution_id,
            status,
        })
        .await;

        Ok(status)
    }

    fn check_trigger(&self, pipeline: &Pipeline) -> Result<(), ExecutionError> {
        if !self.enforce_trigger {
            return Ok(());
        }
        match &pipeline.branch {
            Some(branch) if !pipeline.accepts_branch(branch) => Err(ExecutionError::TriggerRejected {
                branch: branch.clone(),
                patterns: pipeline.trigger_branches.join(", "),
            }),
            _ => Ok(()),
        }
    }

    /// Execute a single stage: its jobs in order, stopping at the first failure
    ///
    /// Returns true when cancellation stopped the stage before all its steps ran.
    async fn execute_stage(&self, pipeline: &mut Pipeline, stage_id: &str) -> Result<bool, ExecutionError> {
        let jobs = pipeline
            .stage(stage_id)
            .map(|s| s.jobs.clone())
            .ok_or_else(|| ExecutionError::StageNotFound(stage_id.to_string()))?;

        let mut context = pipeline.create_context_for_stage(stage_id);
        context.set_variable(
            "workspace",
            self.executor.runner().workspace().to_string_lossy().to_string(),
        );

        let started_at = Utc::now();
        let start = Instant::now();
        if let Some(stage) = pipeline.stage_mut(stage_id) {
            stage.state = StageState::Running { started_at };
        }
        info!("Starting stage: {}", stage_id);
        self.emit_event(ExecutionEvent::StageStarted {
            stage_id: stage_id.to_string(),
        })
        .await;

        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut failure = None;

        for job in &jobs {
            let outcome = self
                .execute_job(stage_id, job, &context.for_job(job))
                .await;
            let success = outcome.success;
            if !success {
                failure = Some(
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("Job '{}' failed", job.id)),
                );
            }
            outcomes.push(outcome);
            if !success {
                break;
            }
        }

        let interrupted = failure.as_deref() == Some(CANCELLED);
        let Some(stage) = pipeline.stage_mut(stage_id) else {
            return Err(ExecutionError::StageNotFound(stage_id.to_string()));
        };
        stage.job_outcomes = outcomes;

        match failure {
            None => {
                stage.state = StageState::Succeeded {
                    started_at,
                    completed_at: Utc::now(),
                };
                info!("Stage {} succeeded", stage_id);
                self.emit_event(ExecutionEvent::StageCompleted {
                    stage_id: stage_id.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
                .await;
            }
            Some(error) => {
                stage.state = StageState::Failed {
                    error: error.clone(),
                    started_at,
                    failed_at: Utc::now(),
                };
                error!("Stage {} failed: {}", stage_id, error);
                self.emit_event(ExecutionEvent::StageFailed {
                    stage_id: stage_id.to_string(),
                    error,
                })
                .await;
            }
        }

        Ok(interrupted)
    }

    /// Execute a job under its timeout
    async fn execute_job(&self, stage_id: &str, job: &Job, context: &PipelineContext) -> JobOutcome {
        info!("Starting job: {}.{}", stage_id, job.id);
        self.emit_event(ExecutionEvent::JobStarted {
            stage_id: stage_id.to_string(),
            job_id: job.id.clone(),
        })
        .await;

        let start = Instant::now();
        let mut steps = Vec::with_capacity(job.steps.len());
        let result = tokio::time::timeout(
            job.timeout,
            self.run_steps(stage_id, job, context, &mut steps),
        )
        .await;

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(_) => {
                warn!("Job {} timed out after {}s", job.id, job.timeout.as_secs());
                Some(format!(
                    "Job '{}' timed out after {} seconds",
                    job.id,
                    job.timeout.as_secs()
                ))
            }
        };

        let outcome = JobOutcome {
            job_id: job.id.clone(),
            success: error.is_none(),
            error,
            steps,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        self.emit_event(ExecutionEvent::JobCompleted {
            stage_id: stage_id.to_string(),
            job_id: job.id.clone(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
        })
        .await;

        outcome
    }

    /// Run the steps of a job in order, collecting their outcomes
    async fn run_steps(
        &self,
        stage_id: &str,
        job: &Job,
        context: &PipelineContext,
        outcomes: &mut Vec<StepOutcome>,
    ) -> Result<(), String> {
        for step in &job.steps {
            if self.is_cancelled() {
                return Err(CANCELLED.to_string());
            }

            let outcome = self.execute_step(stage_id, job, step, context).await;
            let stop = !outcome.success && !outcome.tolerated;
            let error = outcome.error.clone().unwrap_or_default();
            outcomes.push(outcome);

            if stop {
                if self.is_cancelled() {
                    return Err(CANCELLED.to_string());
                }
                return Err(format!("Step '{}' failed: {}", step.name, error));
            }
        }

        Ok(())
    }

    /// Execute a single step, retrying failed attempts
    async fn execute_step(
        &self,
        stage_id: &str,
        job: &Job,
        step: &Step,
        context: &PipelineContext,
    ) -> StepOutcome {
        let max_attempts = step.max_attempts();
        let mut attempt = 1;

        let mut outcome = loop {
            self.emit_event(ExecutionEvent::StepStarted {
                stage_id: stage_id.to_string(),
                job_id: job.id.clone(),
                step_name: step.name.clone(),
                kind: step.kind(),
                attempt,
            })
            .await;

            // dropping the step future kills whatever it spawned
            let mut outcome = tokio::select! {
                outcome = self.executor.execute(step, context) => outcome,
                _ = self.wait_for_cancel() => StepOutcome::failed(&step.name, step.kind(), CANCELLED),
            };
            outcome.attempts = attempt;

            if outcome.success || attempt >= max_attempts || self.is_cancelled() {
                break outcome;
            }

            attempt += 1;
            warn!(
                "Step '{}' failed, retrying (attempt {}/{})",
                step.name, attempt, max_attempts
            );
            self.emit_event(ExecutionEvent::StepRetrying {
                step_name: step.name.clone(),
                attempt,
                max_attempts,
            })
            .await;
        };

        if !outcome.success && step.continue_on_error {
            outcome.tolerated = true;
        }
        self.report_step(&outcome).await;
        outcome
    }

    async fn report_step(&self, outcome: &StepOutcome) {
        let output = outcome.combined_output();
        if !output.is_empty() {
            self.emit_event(ExecutionEvent::StepOutput {
                step_name: outcome.name.clone(),
                output,
            })
            .await;
        }

        if outcome.success {
            if let Some(artifact) = &outcome.artifact {
                let event = if outcome.kind == "publish" {
                    ExecutionEvent::ArtifactPublished {
                        name: artifact.name.clone(),
                        file_count: artifact.file_count,
                        total_size: artifact.total_size,
                    }
                } else {
                    ExecutionEvent::ArtifactDownloaded {
                        name: artifact.name.clone(),
                        file_count: artifact.file_count,
                    }
                };
                self.emit_event(event).await;
            }

            self.emit_event(ExecutionEvent::StepCompleted {
                step_name: outcome.name.clone(),
                duration_ms: outcome.duration_ms,
            })
            .await;
        } else {
            self.emit_event(ExecutionEvent::StepFailed {
                step_name: outcome.name.clone(),
                error: outcome.error.clone().unwrap_or_default(),
                tolerated: outcome.tolerated,
            })
            .await;
        }
    }

    /// Mark a stage as skipped
    async fn mark_stage_skipped(&self, pipeline: &mut Pipeline, stage_id: &str, reason: String) {
        if let Some(stage) = pipeline.stage_mut(stage_id) {
            stage.state = StageState::Skipped {
                reason: reason.clone(),
            };
        }

        self.emit_event(ExecutionEvent::StageSkipped {
            stage_id: stage_id.to_string(),
            reason,
        })
        .await;
    }

    async fn skip_pending(&self, pipeline: &mut Pipeline, reason: &str) {
        let pending: Vec<String> = pipeline
            .stages_in_order()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.id.clone())
            .collect();

        for stage_id in pending {
            self.mark_stage_skipped(pipeline, &stage_id, reason.to_string())
                .await;
        }
    }

    /// Update pipeline state counts
    fn update_state_counts(&self, pipeline: &mut Pipeline) {
        let (succeeded, failed, skipped) = pipeline.stage_counts();
        pipeline.state.update_counts(succeeded, failed, skipped);
    }
}
