//! Step domain model

use crate::core::config::StepConfig;
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Run a shell script locally
    Script { script: String },

    /// Publish a workspace path as a named artifact
    Publish { source: String, artifact: String },

    /// Download a named artifact into a workspace directory
    Download { artifact: String, path: String },

    /// Upload a workspace path to a host
    CopyFiles {
        connection: String,
        source: String,
        target: String,
    },

    /// Run an inline command on a host
    Remote { connection: String, inline: String },
}

impl StepAction {
    /// Short name of the action, as written in YAML
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Script { .. } => "script",
            StepAction::Publish { .. } => "publish",
            StepAction::Download { .. } => "download",
            StepAction::CopyFiles { .. } => "copy_files",
            StepAction::Remote { .. } => "ssh",
        }
    }
}

/// A single step in a job
#[derive(Debug, Clone)]
pub struct Step {
    /// Display name (explicit, or derived from the action)
    pub name: String,

    pub action: StepAction,

    /// Working directory template, relative to the workspace
    pub working_directory: Option<String>,

    /// Environment templates applied on top of the exported variables
    pub env: BTreeMap<String, String>,

    /// Timeout for a single attempt
    pub timeout_secs: Option<u64>,

    pub continue_on_error: bool,

    /// Extra attempts after a failure
    pub retries: u32,
}

impl Step {
    /// Create a step from a step config
    pub fn from_config(config: &StepConfig) -> Result<Self> {
        let action = if let Some(script) = &config.script {
            StepAction::Script {
                script: script.clone(),
            }
        } else if let Some(source) = &config.publish {
            StepAction::Publish {
                source: source.clone(),
                artifact: config.artifact.clone().unwrap_or_default(),
            }
        } else if let Some(artifact) = &config.download {
            StepAction::Download {
                artifact: artifact.clone(),
                path: config.path.clone().unwrap_or_else(|| artifact.clone()),
            }
        } else if let Some(copy) = &config.copy_files {
            StepAction::CopyFiles {
                connection: copy.connection.clone(),
                source: copy.source.clone(),
                target: copy.target.clone(),
            }
        } else if let Some(ssh) = &config.ssh {
            StepAction::Remote {
                connection: ssh.connection.clone(),
                inline: ssh.inline.clone(),
            }
        } else {
            bail!("Step has no action");
        };

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| default_name(&action));

        Ok(Step {
            name,
            action,
            working_directory: config.working_directory.clone(),
            env: config.env_map()?,
            timeout_secs: config.timeout_secs,
            continue_on_error: config.continue_on_error,
            retries: config.retries,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

fn default_name(action: &StepAction) -> String {
    match action {
        StepAction::Script { script } => {
            let first_line = script.lines().next().unwrap_or("").trim();
            if first_line.chars().count() > 40 {
                let short: String = first_line.chars().take(37).collect();
                format!("{}...", short)
            } else {
                first_line.to_string()
            }
        }
        StepAction::Publish { artifact, .. } => format!("Publish {}", artifact),
        StepAction::Download { artifact, .. } => format!("Download {}", artifact),
        StepAction::CopyFiles { connection, .. } => format!("Copy files to {}", connection),
        StepAction::Remote { connection, .. } => format!("Run on {}", connection),
    }
}
