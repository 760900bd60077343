//! Step executor - runs one attempt of a step

use crate::{
    artifact::ArtifactStore,
    core::{PipelineContext, Step, StepAction, StepOutcome},
    execution::runner::StepRunner,
    remote::{CommandOutput, Connection, RemoteExecutor},
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Executes single steps: scripts through the runner, artifacts through the
/// store and deploy steps through the remote executor
pub struct StepExecutor<R> {
    runner: StepRunner,
    artifacts: Arc<dyn ArtifactStore>,
    remote: R,
}

impl<R: RemoteExecutor> StepExecutor<R> {
    pub fn new(runner: StepRunner, artifacts: Arc<dyn ArtifactStore>, remote: R) -> Self {
        Self {
            runner,
            artifacts,
            remote,
        }
    }

    pub fn runner(&self) -> &StepRunner {
        &self.runner
    }

    /// Execute one attempt of a step and describe what happened
    ///
    /// Never fails: every error ends up in the returned outcome.
    pub async fn execute(&self, step: &Step, context: &PipelineContext) -> StepOutcome {
        info!("Executing step: {}", step.name);
        let start = Instant::now();

        let mut outcome = match &step.action {
            StepAction::Script { script } => self.run_script(step, script, context).await,
            StepAction::Publish { source, artifact } => {
                self.limited(step, self.publish(step, source, artifact, context))
                    .await
            }
            StepAction::Download { artifact, path } => {
                self.limited(step, self.download(step, artifact, path, context))
                    .await
            }
            StepAction::CopyFiles {
                connection,
                source,
                target,
            } => {
                self.limited(step, self.copy_files(step, connection, source, target, context))
                    .await
            }
            StepAction::Remote { connection, inline } => {
                self.limited(step, self.remote_command(step, connection, inline, context))
                    .await
            }
        };

        outcome.duration_ms = start.elapsed().as_millis() as u64;
        if let Some(err) = &outcome.error {
            error!("Step '{}' failed: {}", step.name, err);
        }
        outcome
    }

    /// Apply the step timeout to actions that do not spawn a local process
    async fn limited<F>(&self, step: &Step, action: F) -> StepOutcome
    where
        F: Future<Output = StepOutcome>,
    {
        let limit = step
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.runner.config().default_timeout);
        match limit {
            Some(limit) => match timeout(limit, action).await {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::failed(
                    &step.name,
                    step.kind(),
                    format!("timed out after {} seconds", limit.as_secs()),
                ),
            },
            None => action.await,
        }
    }

    async fn run_script(&self, step: &Step, script: &str, context: &PipelineContext) -> StepOutcome {
        let script = context.render(script);
        let working_dir = step
            .working_directory
            .as_ref()
            .map(|dir| self.runner.resolve_path(&context.render(dir)));

        let mut env = context.environment();
        env.extend(
            step.env
                .iter()
                .map(|(key, value)| (key.clone(), context.render(value))),
        );

        let result = self
            .runner
            .run_script(
                &script,
                working_dir.as_deref(),
                &env,
                step.timeout_secs.map(Duration::from_secs),
            )
            .await;

        match result {
            Ok(output) => {
                debug!("Step '{}' exited with code {}", step.name, output.exit_code);
                let mut outcome = StepOutcome::succeeded(&step.name, step.kind());
                outcome.exit_code = Some(output.exit_code);
                outcome.stdout = output.stdout;
                outcome.stderr = output.stderr;
                if !output.success {
                    outcome.success = false;
                    outcome.error = Some(format!("exited with code {}", output.exit_code));
                }
                outcome
            }
            Err(err) => StepOutcome::failed(&step.name, step.kind(), err.to_string()),
        }
    }

    async fn publish(
        &self,
        step: &Step,
        source: &str,
        artifact: &str,
        context: &PipelineContext,
    ) -> StepOutcome {
        let source = self.runner.resolve_path(&context.render(source));

        match self
            .artifacts
            .publish(context.execution_id, artifact, &source)
            .await
        {
            Ok(manifest) => {
                let mut outcome = StepOutcome::succeeded(&step.name, step.kind());
                outcome.stdout = format!(
                    "Published '{}' from {} ({} files, {} bytes)",
                    artifact,
                    source.display(),
                    manifest.entries.len(),
                    manifest.total_size()
                );
                outcome.artifact = Some(manifest.summary());
                outcome
            }
            Err(err) => StepOutcome::failed(&step.name, step.kind(), err.to_string()),
        }
    }

    async fn download(
        &self,
        step: &Step,
        artifact: &str,
        path: &str,
        context: &PipelineContext,
    ) -> StepOutcome {
        let dest = self.runner.resolve_path(&context.render(path));

        match self
            .artifacts
            .download(context.execution_id, artifact, &dest)
            .await
        {
            Ok(manifest) => {
                let mut outcome = StepOutcome::succeeded(&step.name, step.kind());
                outcome.stdout = format!(
                    "Downloaded '{}' to {} ({} files)",
                    artifact,
                    dest.display(),
                    manifest.entries.len()
                );
                outcome.artifact = Some(manifest.summary());
                outcome
            }
            Err(err) => StepOutcome::failed(&step.name, step.kind(), err.to_string()),
        }
    }

    async fn copy_files(
        &self,
        step: &Step,
        connection: &str,
        source: &str,
        target: &str,
        context: &PipelineContext,
    ) -> StepOutcome {
        let connection = match self.lookup(step, connection, context) {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let source: PathBuf = self.runner.resolve_path(&context.render(source));
        let target = context.render(target);

        info!(
            "Copying {} to {}:{}",
            source.display(),
            connection.destination(),
            target
        );
        let result = self.remote.upload(connection, &source, &target).await;
        command_outcome(step, result)
    }

    async fn remote_command(
        &self,
        step: &Step,
        connection: &str,
        inline: &str,
        context: &PipelineContext,
    ) -> StepOutcome {
        let connection = match self.lookup(step, connection, context) {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let command = context.render(inline);

        info!("Running on {}: {}", connection.destination(), command);
        let result = self.remote.run(connection, &command).await;
        command_outcome(step, result)
    }

    fn lookup<'c>(
        &self,
        step: &Step,
        name: &str,
        context: &'c PipelineContext,
    ) -> Result<&'c Connection, StepOutcome> {
        context.connection(name).ok_or_else(|| {
            StepOutcome::failed(
                &step.name,
                step.kind(),
                format!("unknown connection '{}'", name),
            )
        })
    }
}

fn command_outcome(
    step: &Step,
    result: Result<CommandOutput, crate::remote::RemoteError>,
) -> StepOutcome {
    match result {
        Ok(output) => {
            let mut outcome = StepOutcome::succeeded(&step.name, step.kind());
            outcome.exit_code = Some(output.exit_code);
            outcome.stdout = output.stdout;
            outcome.stderr = output.stderr;
            if !output.success {
                outcome.success = false;
                outcome.error = Some(format!("remote command exited with code {}", output.exit_code));
            }
            outcome
        }
        Err(err) => StepOutcome::failed(&step.name, step.kind(), err.to_string()),
    }
}
