//! CLI output formatting

use crate::{
    artifact::ArtifactManifest,
    core::ExecutionStatus,
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "* ");

/// Stage progress bar for a run
///
/// Event lines should be printed through [`ProgressBar::suspend`] so they
/// also show when stdout is not a terminal.
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} stages {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule as wide as the terminal
pub fn separator() -> String {
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80);
    style("─".repeat(width)).dim().to_string()
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Cancelled => WARN,
        ExecutionStatus::Pending => INFO,
    };
    let branch = summary
        .branch
        .as_deref()
        .map(|b| format!(" [{}]", b))
        .unwrap_or_default();

    format!(
        "{}{} - {}{} - {} ({} ok, {} failed, {} skipped of {}) - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        style(branch).cyan(),
        format_status(summary.status),
        summary.succeeded_stages,
        summary.failed_stages,
        summary.skipped_stages,
        summary.total_stages,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            total_stages,
        } => format!(
            "{}Starting pipeline {} ({}, {} stages)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(execution_id)).dim(),
            total_stages
        ),
        ExecutionEvent::StageStarted { stage_id } => {
            format!("{}\n{}Stage {}", separator(), ROCKET, style(stage_id).bold())
        }
        ExecutionEvent::StageSkipped { stage_id, reason } => format!(
            "{}Stage {} skipped: {}",
            SKIP,
            style(stage_id).dim(),
            style(reason).dim()
        ),
        ExecutionEvent::StageCompleted {
            stage_id,
            duration_ms,
        } => format!(
            "{}Stage {} succeeded ({})",
            CHECK,
            style(stage_id).green(),
            format_duration(Duration::from_millis(*duration_ms))
        ),
        ExecutionEvent::StageFailed { stage_id, error } => format!(
            "{}Stage {} failed: {}",
            CROSS,
            style(stage_id).red(),
            style(error).dim()
        ),
        ExecutionEvent::JobStarted { job_id, .. } => {
            format!("  {}Job {}", INFO, style(job_id).cyan())
        }
        ExecutionEvent::JobCompleted {
            job_id,
            success,
            duration_ms,
            ..
        } => {
            let (icon, result) = if *success {
                (CHECK, style("succeeded").green())
            } else {
                (CROSS, style("failed").red())
            };
            format!(
                "  {}Job {} {} ({})",
                icon,
                style(job_id).cyan(),
                result,
                format_duration(Duration::from_millis(*duration_ms))
            )
        }
        ExecutionEvent::StepStarted {
            step_name,
            kind,
            attempt,
            ..
        } => {
            if *attempt > 1 {
                format!(
                    "    {}{} {} (attempt {})",
                    SPINNER,
                    style(step_name).cyan(),
                    style(kind).dim(),
                    attempt
                )
            } else {
                format!("    {}{} {}", SPINNER, style(step_name).cyan(), style(kind).dim())
            }
        }
        ExecutionEvent::StepOutput { step_name, output } => {
            format!("    {}Output from {}:\n{}", INFO, style(step_name).dim(), output)
        }
        ExecutionEvent::StepCompleted {
            step_name,
            duration_ms,
        } => format!(
            "    {}{} ({})",
            CHECK,
            style(step_name).green(),
            format_duration(Duration::from_millis(*duration_ms))
        ),
        ExecutionEvent::StepFailed {
            step_name,
            error,
            tolerated,
        } => {
            if *tolerated {
                format!(
                    "    {}{}: {} (continuing)",
                    WARN,
                    style(step_name).yellow(),
                    style(error).dim()
                )
            } else {
                format!("    {}{}: {}", CROSS, style(step_name).red(), style(error).dim())
            }
        }
        ExecutionEvent::StepRetrying {
            step_name,
            attempt,
            max_attempts,
        } => format!(
            "    {}{} (attempt {}/{})",
            WARN,
            style(step_name).yellow(),
            attempt,
            max_attempts
        ),
        ExecutionEvent::ArtifactPublished {
            name,
            file_count,
            total_size,
        } => format!(
            "    {}Published {} ({} files, {})",
            PACKAGE,
            style(name).bold(),
            file_count,
            format_size(*total_size)
        ),
        ExecutionEvent::ArtifactDownloaded { name, file_count } => format!(
            "    {}Downloaded {} ({} files)",
            PACKAGE,
            style(name).bold(),
            file_count
        ),
        ExecutionEvent::PipelineCompleted {
            execution_id,
            status,
        } => {
            let status_str = match status {
                ExecutionStatus::Completed => {
                    format!("completed {}", style("successfully").green())
                }
                ExecutionStatus::Failed => style("failed").red().to_string(),
                other => format_status(*other),
            };
            format!(
                "{}\n{}Pipeline ({}) {}",
                separator(),
                INFO,
                style(short_id(execution_id)).dim(),
                status_str
            )
        }
    }
}

/// One line per artifact of a run
pub fn format_artifact(manifest: &ArtifactManifest) -> String {
    format!(
        "{}{} - {} files, {} - {}",
        PACKAGE,
        style(&manifest.name).bold(),
        manifest.entries.len(),
        format_size(manifest.total_size()),
        style(manifest.created_at.to_rfc3339()).dim()
    )
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
