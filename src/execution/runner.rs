//! Step runner - spawns shell scripts and captures their output

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Configuration for the step runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory relative paths are resolved against
    pub workspace: PathBuf,

    /// Shell program scripts are passed to
    pub shell: String,

    /// Flag that makes the shell run its next argument
    pub shell_flag: String,

    /// Timeout for steps that do not set one
    pub default_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let (shell, shell_flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
        Self {
            workspace: PathBuf::from("."),
            shell: shell.to_string(),
            shell_flag: shell_flag.to_string(),
            default_timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout_secs: u64) -> Self {
        self.default_timeout = Some(Duration::from_secs(timeout_secs));
        self
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
}

/// Errors that keep a script from producing an exit code
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkingDirectory(PathBuf),

    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("failed to collect process output: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs shell scripts for steps
#[derive(Debug, Clone, Default)]
pub struct StepRunner {
    config: RunnerConfig,
}

impl StepRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.config.workspace
    }

    /// Expand `~` and resolve relative paths against the workspace
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
        if expanded.is_absolute() {
            expanded
        } else {
            self.config.workspace.join(expanded)
        }
    }

    /// Run `script` through the shell
    ///
    /// The child inherits the runner's environment plus `env`. On unix it gets
    /// its own process group, which is killed when `step_timeout` (or the
    /// configured default) elapses or the returned future is dropped.
    pub async fn run_script(
        &self,
        script: &str,
        working_dir: Option<&Path>,
        env: &[(String, String)],
        step_timeout: Option<Duration>,
    ) -> Result<ProcessOutput, RunnerError> {
        let cwd = working_dir.unwrap_or(self.config.workspace.as_path());
        if !cwd.is_dir() {
            return Err(RunnerError::MissingWorkingDirectory(cwd.to_path_buf()));
        }

        debug!("Running script in {}: {}", cwd.display(), script);

        let start = Instant::now();
        let mut command = Command::new(&self.config.shell);
        command
            .arg(&self.config.shell_flag)
            .arg(script)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            shell: self.config.shell.clone(),
            source,
        })?;
        #[cfg(unix)]
        let group = ProcessGroup::new(child.id());

        let output = match step_timeout.or(self.config.default_timeout) {
            // dropping the wait future drops the child, which kills it
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!("Script timed out after {}s, killed", limit.as_secs());
                    return Err(RunnerError::Timeout(limit.as_secs()));
                }
            },
            None => child.wait_with_output().await?,
        };
        #[cfg(unix)]
        group.release();

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Process group of a running script
///
/// Dropping it kills every process in the group.
#[cfg(unix)]
struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

#[cfg(unix)]
impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| libc::pid_t::try_from(pid).ok()),
        }
    }

    /// Keep the group alive after the script exited normally
    fn release(mut self) {
        self.pgid = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            debug!("Killing process group {}", pgid);
            // SAFETY: killpg has no memory-safety preconditions
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}
