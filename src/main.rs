use anyhow::{Context, Result};
use stagecoach::artifact::{ArtifactStore, LocalArtifactStore};
use stagecoach::cli::commands::{
    ArtifactsCommand, HistoryCommand, ListCommand, RunCommand, ValidateCommand,
};
use stagecoach::cli::output::*;
use stagecoach::cli::{Cli, Command};
use stagecoach::core::config::PipelineConfig;
use stagecoach::core::ExecutionStatus;
use stagecoach::execution::{
    ExecutionEngine, ExecutionEvent, RunnerConfig, StepExecutor, StepRunner,
};
use stagecoach::persistence::{
    create_summary, ExecutionSummary, InMemoryPersistence, PersistenceBackend,
};
use stagecoach::remote::SshClient;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stagecoach={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let success = match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, cli.stream).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Artifacts(cmd) => list_artifacts(cmd).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    let store = stagecoach::persistence::SqliteExecutionStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    warn!("Built without the sqlite feature, history is not kept between runs");
    Ok(Arc::new(InMemoryPersistence::new()))
}

fn open_artifacts(dir: Option<&PathBuf>) -> Result<LocalArtifactStore> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;
            Ok(LocalArtifactStore::new(dir))
        }
        None => LocalArtifactStore::with_default_path(),
    }
}

async fn run_pipeline(cmd: &RunCommand, stream: bool) -> Result<bool> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;

    println!("{}Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline()?;

    if !cmd.variable.is_empty() {
        for (key, value) in &cmd.variable {
            println!(
                "{}Variable override: {} = {}",
                INFO,
                style(key).cyan(),
                style(value).dim()
            );
        }
        pipeline.override_variables(cmd.variable.iter().cloned().collect());
    }
    if let Some(branch) = &cmd.branch {
        pipeline.set_branch(branch.clone());
    }

    let workspace = match &cmd.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(open_artifacts(cmd.artifacts_dir.as_ref())?);
    let mut runner_config = RunnerConfig::new().with_workspace(workspace);
    if let Some(secs) = cmd.step_timeout {
        runner_config = runner_config.with_default_timeout(secs);
    }
    let runner = StepRunner::new(runner_config);
    let executor = StepExecutor::new(runner, artifacts, SshClient::default());

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let engine = ExecutionEngine::new(executor)
        .with_cancellation(cancelled)
        .ignore_trigger(cmd.force);

    let progress = create_progress_bar(pipeline.stages.len());
    let bar = progress.clone();
    engine
        .add_event_handler(move |event| {
            match &event {
                ExecutionEvent::StepOutput { output, .. } => {
                    if stream {
                        bar.suspend(|| println!("{}", format_output(output, 20)));
                    }
                    return;
                }
                ExecutionEvent::StageCompleted { stage_id, .. }
                | ExecutionEvent::StageFailed { stage_id, .. }
                | ExecutionEvent::StageSkipped { stage_id, .. } => {
                    bar.inc(1);
                    bar.set_message(stage_id.clone());
                }
                _ => {}
            }
            bar.suspend(|| println!("{}", format_execution_event(&event)));
        })
        .await;

    println!();
    let result = engine.execute(&mut pipeline).await;
    progress.finish_and_clear();

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            error!("{}", e);
            println!("\n{}{} {}", CROSS, style(&pipeline.name).bold(), style(&e).red());
            if pipeline.state.started_at.is_some() {
                store.save_execution(&create_summary(&pipeline)).await?;
            }
            return Ok(false);
        }
    };

    if !cmd.no_history {
        let summary = create_summary(&pipeline);
        store.save_execution(&summary).await?;
        println!(
            "\n{}Execution saved to history (ID: {})",
            INFO,
            style(summary.execution_id).dim()
        );
    }

    match status {
        ExecutionStatus::Completed => {
            println!(
                "\n{}{} completed {}",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green()
            );
            Ok(true)
        }
        other => {
            println!(
                "\n{}{} {}",
                CROSS,
                style(&pipeline.name).bold(),
                format_status(other)
            );
            Ok(false)
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<bool> {
    if !cmd.json {
        println!("{}Validating pipeline...", INFO);
    }

    let loaded = PipelineConfig::from_file(&cmd.file).and_then(|config| {
        let pipeline = config.to_pipeline()?;
        Ok((config, pipeline))
    });

    let (config, pipeline) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("{}Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            return Ok(false);
        }
    };

    if cmd.json {
        let stages: Vec<_> = config
            .stages
            .iter()
            .map(|stage| {
                serde_json::json!({
                    "stage": stage.stage,
                    "depends_on": stage.depends_on,
                    "condition": stage.condition.as_deref().unwrap_or("succeeded()"),
                    "jobs": stage.jobs.iter().map(|job| serde_json::json!({
                        "job": job.job,
                        "steps": job.steps.len(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        let data = serde_json::json!({
            "name": config.name,
            "valid": true,
            "stages": stages,
            "execution_order": pipeline.execution_order(),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    println!("{}Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Stages: {}", style(config.stages.len()).cyan());
    println!("  Connections: {}", style(config.connections.len()).cyan());
    for stage in pipeline.stages_in_order() {
        let deps = if stage.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (after {})", stage.dependencies.join(", "))
        };
        println!(
            "  {} {}{} if {}",
            style("stage").dim(),
            style(stage.label()).bold(),
            deps,
            style(&stage.condition).cyan()
        );
        for job in &stage.jobs {
            println!("    {} {} ({} steps)", style("job").dim(), job.label(), job.steps.len());
            for step in &job.steps {
                println!("      - {} {}", step.name, style(step.kind()).dim());
            }
        }
    }
    println!(
        "  Execution order: {}",
        style(pipeline.execution_order().join(" -> ")).cyan()
    );

    Ok(true)
}

async fn list_pipelines(cmd: &ListCommand) -> Result<bool> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if cmd.json {
        let mut json_data = Vec::new();
        for pipeline in &pipelines {
            let executions = store.list_executions(pipeline).await?;
            json_data.push(serde_json::json!({
                "name": pipeline,
                "execution_count": executions.len(),
            }));
        }
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if pipelines.is_empty() {
        println!("{}No pipelines found in history", INFO);
        return Ok(true);
    }

    println!("{}Pipelines in history:", INFO);

    for pipeline_name in &pipelines {
        if cmd.with_counts {
            let executions = store.list_executions(pipeline_name).await?;
            let count = |status: ExecutionStatus| executions.iter().filter(|e| e.status == status).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed, {} cancelled)",
                style(pipeline_name).bold(),
                style(executions.len()).cyan(),
                style(count(ExecutionStatus::Completed)).green(),
                style(count(ExecutionStatus::Failed)).red(),
                style(count(ExecutionStatus::Cancelled)).yellow()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    Ok(true)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = open_history().await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;

        return match store.load_execution(exec_id).await? {
            Some(summary) if cmd.json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(true)
            }
            Some(summary) => {
                print_execution_details(&summary, cmd.details)?;
                Ok(true)
            }
            None => {
                println!("{}Execution not found", WARN);
                Ok(false)
            }
        };
    }

    let mut executions = match &cmd.pipeline {
        Some(pipeline_name) => store.list_executions(pipeline_name).await?,
        None => {
            let mut all = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all.extend(store.list_executions(&pipeline).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if executions.is_empty() {
        println!("{}No executions found", INFO);
        return Ok(true);
    }

    println!("{}Execution history (showing latest {}):", INFO, executions.len());
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }

    Ok(true)
}

fn print_execution_details(summary: &ExecutionSummary, details: bool) -> Result<()> {
    println!("{}Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    if let Some(branch) = &summary.branch {
        println!("  Branch: {}", style(branch).cyan());
    }
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Stages: {} succeeded, {} failed, {} skipped of {} ({})",
        style(summary.succeeded_stages).green(),
        style(summary.failed_stages).red(),
        style(summary.skipped_stages).dim(),
        summary.total_stages,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    );

    if details {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}

async fn list_artifacts(cmd: &ArtifactsCommand) -> Result<bool> {
    let run_id = Uuid::parse_str(&cmd.execution_id).context("Invalid execution ID format")?;
    let store = open_artifacts(cmd.artifacts_dir.as_ref())?;
    let manifests = store
        .list(run_id)
        .await
        .with_context(|| format!("Failed to list artifacts of run {}", run_id))?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(true);
    }

    if manifests.is_empty() {
        println!("{}No artifacts published by run {}", INFO, style(run_id).dim());
        return Ok(true);
    }

    println!("{}Artifacts of run {}:", INFO, style(run_id).dim());
    for manifest in &manifests {
        println!("  {}", format_artifact(manifest));
    }

    Ok(true)
}
