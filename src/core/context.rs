//! Pipeline context - variables and connections visible to a stage

use crate::core::{stage::Job, state::StageResult};
use crate::remote::Connection;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;
use uuid::Uuid;

/// Process variables a pipeline variable is never exported over
///
/// A step can still set these through its own `env`.
const RESERVED_ENV: &[&str] = &["PATH", "HOME", "SHELL", "USER", "LOGNAME", "PWD", "IFS"];

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Execution context for a stage or job
///
/// Holds the merged variables (pipeline, stage, job and predefined ones),
/// the results of the stage's dependencies and the service connections.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Run this context belongs to
    pub execution_id: Uuid,

    /// Variables available for rendering
    pub variables: HashMap<String, String>,

    /// Results of the stage's direct dependencies
    pub dependency_results: HashMap<String, StageResult>,

    /// Service connections, by name
    pub connections: HashMap<String, Connection>,
}

impl PipelineContext {
    /// Create a new empty context
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            variables: HashMap::new(),
            dependency_results: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    /// Replace `{{ name }}` placeholders; unknown names are left as written
    pub fn render(&self, template: &str) -> String {
        placeholder_regex()
            .replace_all(template, |caps: &Captures| match self.variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Variables exported to child processes, sorted by name
    ///
    /// `pipeline.name` becomes `PIPELINE_NAME`, `app-dir` becomes `APP_DIR`.
    /// Variables that would shadow a reserved name such as `PATH` are left out.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .variables
            .iter()
            .filter_map(|(key, value)| {
                let name = env_name(key);
                if RESERVED_ENV.contains(&name.as_str()) {
                    warn!("Variable '{}' is not exported: {} is reserved", key, name);
                    None
                } else {
                    Some((name, value.clone()))
                }
            })
            .collect();
        env.sort();
        env
    }

    /// Context for one job of the stage
    pub fn for_job(&self, job: &Job) -> Self {
        let mut context = self.clone();
        context.variables.extend(job.variables.clone());
        context.set_variable("job.name", job.id.clone());
        context
    }
}

/// Environment variable name for a pipeline variable
pub fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}
