//! Remote execution over SSH
//!
//! Deploy steps reach their target hosts through a [`RemoteExecutor`]. The
//! production implementation is [`SshClient`], which drives the system `ssh`
//! and `scp` binaries; tests swap in a recording fake.

pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use ssh::{SshClient, SshOptions};

/// A service connection: where and as whom to log in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Name the pipeline refers to the connection by
    pub name: String,

    pub host: String,

    pub user: String,

    pub port: u16,

    /// Private key used for authentication (already tilde-expanded)
    pub identity_file: Option<PathBuf>,
}

impl Connection {
    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Check if the connection points at the local machine
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandOutput {
    pub(crate) fn from_output(output: &std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
        }
    }
}

/// Errors that stop a remote operation from being attempted at all
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("identity file for connection '{connection}' not found: {}", path.display())]
    IdentityFileNotFound { connection: String, path: PathBuf },

    #[error("local path not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs commands on, and copies files to, a remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run an inline shell command on the host
    async fn run(&self, connection: &Connection, command: &str)
        -> Result<CommandOutput, RemoteError>;

    /// Copy a local file, or the contents of a local directory, into
    /// `remote_dir` on the host. The directory is created when missing.
    async fn upload(
        &self,
        connection: &Connection,
        local: &Path,
        remote_dir: &str,
    ) -> Result<CommandOutput, RemoteError>;
}

/// Quote a value for a POSIX shell (always quotes)
pub fn quote_path(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(host: &str) -> Connection {
        Connection {
            name: "vm".to_string(),
            host: host.to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
        }
    }

    #[test]
    fn test_destination_and_locality() {
        assert_eq!(connection("10.0.0.5").destination(), "deploy@10.0.0.5");
        assert!(!connection("10.0.0.5").is_local());
        assert!(connection("localhost").is_local());
        assert!(connection("::1").is_local());
    }

    #[test]
    fn test_quote_path() {
        assert_eq!(quote_path("/var/www/html"), "'/var/www/html'");
        assert_eq!(quote_path("it's"), "'it'\\''s'");
    }
}
