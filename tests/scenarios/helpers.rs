//! Test utilities for pipeline scenarios

use async_trait::async_trait;
use stagecoach::artifact::{ArtifactStore, LocalArtifactStore};
use stagecoach::core::config::PipelineConfig;
use stagecoach::core::{ExecutionStatus, Pipeline, StageState, StepOutcome};
use stagecoach::execution::{
    ExecutionEngine, ExecutionError, ExecutionEvent, RunnerConfig, StepExecutor, StepRunner,
};
use stagecoach::remote::{CommandOutput, Connection, RemoteError, RemoteExecutor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// One call made against the fake remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run { connection: String, command: String },
    Upload { connection: String, files: Vec<String>, remote_dir: String },
}

/// Remote executor that records calls instead of opening SSH sessions
///
/// Commands containing `exit 1` report a failure.
#[derive(Clone, Default)]
pub struct RecordingRemote {
    calls: Arc<Mutex<Vec<RemoteCall>>>,
}

impl RecordingRemote {
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn listing(local: &Path) -> Vec<String> {
    if local.is_file() {
        return vec![local.file_name().unwrap().to_string_lossy().to_string()];
    }
    let mut files: Vec<String> = std::fs::read_dir(local)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[async_trait]
impl RemoteExecutor for RecordingRemote {
    async fn run(&self, connection: &Connection, command: &str) -> Result<CommandOutput, RemoteError> {
        self.calls.lock().unwrap().push(RemoteCall::Run {
            connection: connection.name.clone(),
            command: command.to_string(),
        });
        let failed = command.contains("exit 1");
        Ok(CommandOutput {
            stdout: format!("ran on {}", connection.host),
            stderr: String::new(),
            exit_code: if failed { 1 } else { 0 },
            success: !failed,
        })
    }

    async fn upload(
        &self,
        connection: &Connection,
        local: &Path,
        remote_dir: &str,
    ) -> Result<CommandOutput, RemoteError> {
        if !local.exists() {
            return Err(RemoteError::SourceNotFound(local.to_path_buf()));
        }
        self.calls.lock().unwrap().push(RemoteCall::Upload {
            connection: connection.name.clone(),
            files: listing(local),
            remote_dir: remote_dir.to_string(),
        });
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        })
    }
}

/// A workspace and artifact store that live for one test
pub struct Harness {
    pub workspace: TempDir,
    pub store: TempDir,
    pub remote: RecordingRemote,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            workspace: tempfile::tempdir().unwrap(),
            store: tempfile::tempdir().unwrap(),
            remote: RecordingRemote::default(),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.workspace.path().join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative))
            .unwrap_or_else(|e| panic!("cannot read {}: {}", relative, e))
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        Arc::new(LocalArtifactStore::new(self.store.path()))
    }

    pub fn engine(&self) -> ExecutionEngine<RecordingRemote> {
        let runner = StepRunner::new(RunnerConfig::new().with_workspace(self.workspace.path()));
        ExecutionEngine::new(StepExecutor::new(runner, self.artifacts(), self.remote.clone()))
    }

    /// Run a pipeline and record every event it emits
    pub async fn run(&self, yaml: &str) -> PipelineTestResult {
        self.run_with(yaml, |_| {}).await
    }

    pub async fn run_with(&self, yaml: &str, prepare: impl FnOnce(&mut Pipeline)) -> PipelineTestResult {
        let mut pipeline = pipeline_from_yaml(yaml);
        prepare(&mut pipeline);

        let engine = self.engine();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine
            .add_event_handler(move |event| sink.lock().unwrap().push(event))
            .await;

        let result = engine.execute(&mut pipeline).await;
        let events = events.lock().unwrap().clone();
        PipelineTestResult {
            pipeline,
            result,
            events,
        }
    }
}

pub fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml)
        .expect("pipeline YAML should load")
        .to_pipeline()
        .expect("pipeline should build")
}

/// Everything a scenario wants to look at after a run
pub struct PipelineTestResult {
    pub pipeline: Pipeline,
    pub result: Result<ExecutionStatus, ExecutionError>,
    pub events: Vec<ExecutionEvent>,
}

impl PipelineTestResult {
    pub fn status(&self) -> ExecutionStatus {
        match &self.result {
            Ok(status) => *status,
            Err(e) => panic!("pipeline did not run: {}", e),
        }
    }

    pub fn stage_state(&self, stage_id: &str) -> &StageState {
        &self
            .pipeline
            .stage(stage_id)
            .unwrap_or_else(|| panic!("Stage '{}' not found", stage_id))
            .state
    }

    /// Outcome of a step, looked up by name across all jobs of a stage
    pub fn step(&self, stage_id: &str, step_name: &str) -> &StepOutcome {
        self.pipeline
            .stage(stage_id)
            .unwrap_or_else(|| panic!("Stage '{}' not found", stage_id))
            .job_outcomes
            .iter()
            .flat_map(|job| job.steps.iter())
            .find(|step| step.name == step_name)
            .unwrap_or_else(|| panic!("Step '{}' did not run in stage '{}'", step_name, stage_id))
    }

    /// Stages in the order they started
    pub fn started_stages(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::StageStarted { stage_id } => Some(stage_id.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn assert_pipeline_status(result: &PipelineTestResult, expected: ExecutionStatus) {
    assert_eq!(
        result.status(),
        expected,
        "pipeline ended {:?}, stages: {:?}",
        result.status(),
        result
            .pipeline
            .stages_in_order()
            .map(|s| (s.id.clone(), s.state.clone()))
            .collect::<Vec<_>>()
    );
    assert_eq!(result.pipeline.state.status, expected);
}

pub fn assert_stage_succeeded(result: &PipelineTestResult, stage_id: &str) {
    let state = result.stage_state(stage_id);
    assert!(
        matches!(state, StageState::Succeeded { .. }),
        "Stage '{}' should have succeeded, but was {:?}",
        stage_id,
        state
    );
}

pub fn assert_stage_failed(result: &PipelineTestResult, stage_id: &str, expected_error: &str) {
    match result.stage_state(stage_id) {
        StageState::Failed { error, .. } => assert!(
            error.contains(expected_error),
            "Stage '{}' error:\n{}\n\ndoes not contain:\n{}",
            stage_id,
            error,
            expected_error
        ),
        other => panic!("Stage '{}' should have failed, but was {:?}", stage_id, other),
    }
}

pub fn assert_stage_skipped(result: &PipelineTestResult, stage_id: &str) {
    let state = result.stage_state(stage_id);
    assert!(
        matches!(state, StageState::Skipped { .. }),
        "Stage '{}' should have been skipped, but was {:?}",
        stage_id,
        state
    );
    assert!(
        !result.started_stages().iter().any(|s| s == stage_id),
        "Skipped stage '{}' was started",
        stage_id
    );
}

pub fn assert_step_output(result: &PipelineTestResult, stage_id: &str, step_name: &str, expected: &str) {
    let step = result.step(stage_id, step_name);
    assert!(
        step.stdout.contains(expected),
        "Step '{}' output:\n{}\n\ndoes not contain:\n{}",
        step_name,
        step.stdout,
        expected
    );
}
