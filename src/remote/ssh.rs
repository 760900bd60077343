//! SSH client built on the system `ssh` and `scp` binaries

use crate::remote::{quote_path, CommandOutput, Connection, RemoteError, RemoteExecutor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Delays before the second and later attempts (seconds)
const BACKOFF_SECS: [u64; 2] = [2, 5];

/// Connection tuning for [`SshClient`]
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Passed as `-o ConnectTimeout=<n>`
    pub connect_timeout_secs: u64,

    /// Attempts made when the connection itself fails
    pub max_attempts: u32,

    /// Program used for remote commands
    pub ssh_program: String,

    /// Program used for uploads
    pub scp_program: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_attempts: 3,
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }
}

/// Remote executor that shells out to `ssh` / `scp`
///
/// Hosts named `localhost`, `127.0.0.1` or `::1` are handled without SSH:
/// commands run through `sh -c` and uploads become `cp -R`.
#[derive(Debug, Clone, Default)]
pub struct SshClient {
    options: SshOptions,
}

impl SshClient {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]
    }

    /// Arguments for `ssh` running `command` on the connection's host
    pub fn build_ssh_args(&self, connection: &Connection, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &connection.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.to_string_lossy().to_string());
        }

        if connection.port != 22 {
            args.push("-p".to_string());
            args.push(connection.port.to_string());
        }

        args.extend(self.common_options());
        args.push(connection.destination());
        args.push(command.to_string());
        args
    }

    /// Arguments for `scp -r` copying `sources` into `remote_dir`
    ///
    /// The remote path is passed as is: scp's SFTP mode does not run it
    /// through a remote shell.
    pub fn build_scp_args(
        &self,
        connection: &Connection,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> Vec<String> {
        let mut args = vec!["-r".to_string()];

        if let Some(identity_file) = &connection.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.to_string_lossy().to_string());
        }

        if connection.port != 22 {
            args.push("-P".to_string());
            args.push(connection.port.to_string());
        }

        args.extend(self.common_options());
        args.extend(sources.iter().map(|s| s.to_string_lossy().to_string()));
        args.push(format!("{}:{}", connection.destination(), remote_dir));
        args
    }

    fn check_identity(&self, connection: &Connection) -> Result<(), RemoteError> {
        match &connection.identity_file {
            Some(path) if !path.exists() => Err(RemoteError::IdentityFileNotFound {
                connection: connection.name.clone(),
                path: path.clone(),
            }),
            _ => Ok(()),
        }
    }

    async fn execute_once(&self, program: &str, args: &[String]) -> Result<CommandOutput, RemoteError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput::from_output(&output))
    }

    /// Run a command, retrying only transient connection failures
    async fn execute_with_retry(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, RemoteError> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = self.execute_once(program, args).await?;
            attempt += 1;

            if result.success || attempt >= max_attempts || !is_transient_ssh_error(&result) {
                return Ok(result);
            }

            let delay = BACKOFF_SECS
                .get(attempt as usize - 1)
                .copied()
                .unwrap_or(5);
            warn!(
                "{} connection failed (attempt {}/{}), retrying in {}s...",
                program, attempt, max_attempts, delay
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    /// Top-level entries of a directory, or the path itself for a file
    async fn upload_sources(local: &Path) -> Result<Vec<PathBuf>, RemoteError> {
        let metadata = tokio::fs::metadata(local)
            .await
            .map_err(|_| RemoteError::SourceNotFound(local.to_path_buf()))?;

        if !metadata.is_dir() {
            return Ok(vec![local.to_path_buf()]);
        }

        let mut entries = tokio::fs::read_dir(local)
            .await
            .map_err(|_| RemoteError::SourceNotFound(local.to_path_buf()))?;
        let mut sources = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| RemoteError::ReadSource {
                path: local.to_path_buf(),
                source,
            })?
        {
            sources.push(entry.path());
        }
        sources.sort();
        Ok(sources)
    }

    async fn upload_local(
        &self,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> Result<CommandOutput, RemoteError> {
        tokio::fs::create_dir_all(remote_dir)
            .await
            .map_err(|source| RemoteError::Spawn {
                program: "mkdir".to_string(),
                source,
            })?;

        if sources.is_empty() {
            return Ok(empty_success());
        }

        let mut args = vec!["-R".to_string()];
        args.extend(sources.iter().map(|s| s.to_string_lossy().to_string()));
        args.push(remote_dir.to_string());
        self.execute_once("cp", &args).await
    }
}

#[async_trait]
impl RemoteExecutor for SshClient {
    async fn run(
        &self,
        connection: &Connection,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        if connection.is_local() {
            debug!("Connection '{}' is localhost, running locally", connection.name);
            let args = vec!["-c".to_string(), command.to_string()];
            return self.execute_once("sh", &args).await;
        }

        self.check_identity(connection)?;
        let args = self.build_ssh_args(connection, command);
        debug!("ssh {}", args.join(" "));
        self.execute_with_retry(&self.options.ssh_program, &args).await
    }

    async fn upload(
        &self,
        connection: &Connection,
        local: &Path,
        remote_dir: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let sources = Self::upload_sources(local).await?;

        if connection.is_local() {
            return self.upload_local(&sources, remote_dir).await;
        }

        self.check_identity(connection)?;

        let mkdir = self
            .run(connection, &format!("mkdir -p {}", quote_path(remote_dir)))
            .await?;
        if !mkdir.success || sources.is_empty() {
            return Ok(mkdir);
        }

        let args = self.build_scp_args(connection, &sources, remote_dir);
        debug!("scp {}", args.join(" "));
        self.execute_with_retry(&self.options.scp_program, &args).await
    }
}

fn empty_success() -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 0,
        success: true,
    }
}

/// Check if an SSH failure is a transient connection error worth retrying
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // exit code 255 is ssh's own failure, not the remote command's
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "broken pipe",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}
