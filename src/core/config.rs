//! Pipeline configuration from YAML

use crate::artifact::validate_name;
use crate::core::condition::Condition;
use crate::core::Pipeline;
use crate::remote::Connection;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Job timeout used when neither the job nor the pipeline sets one
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Variable definition - can be a simple string or a file reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableDefinition {
    /// Simple string value
    String(String),
    /// File reference with validation flag
    File { path: String, validate_exists: bool },
}

impl VariableDefinition {
    /// Value substituted for `{{ name }}`
    pub fn render_value(&self) -> String {
        match self {
            VariableDefinition::String(s) => s.clone(),
            VariableDefinition::File { path, .. } => path.clone(),
        }
    }
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Branches the pipeline runs for
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,

    /// Global variables available to all stages
    #[serde(default)]
    variables: HashMap<String, Value>,

    /// Service connections, by name
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Pipeline stages, in declaration order
    pub stages: Vec<StageConfig>,

    /// Default timeout for jobs (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Branch patterns, `*` matches any run of characters
    #[serde(default)]
    pub branches: Vec<String>,
}

/// SSH endpoint a deploy step can reach
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,

    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key, `~` is expanded
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ConnectionConfig {
    pub fn to_connection(&self, name: &str) -> Connection {
        Connection {
            name: name.to_string(),
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            identity_file: self
                .identity_file
                .as_ref()
                .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned())),
        }
    }
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage identifier
    pub stage: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Stages that must finish before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Run condition, `succeeded()` when absent
    #[serde(default)]
    pub condition: Option<String>,

    /// Stage variables (override pipeline variables)
    #[serde(default)]
    variables: HashMap<String, Value>,

    pub jobs: Vec<JobConfig>,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job identifier, unique within its stage
    pub job: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Timeout for the whole job (overrides the pipeline default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    variables: HashMap<String, Value>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
///
/// Exactly one of `script`, `publish`, `download`, `copy_files` and `ssh`
/// must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Shell script run with `sh -c`
    #[serde(default)]
    pub script: Option<String>,

    /// Path to publish as an artifact
    #[serde(default)]
    pub publish: Option<String>,

    /// Artifact name for `publish`
    #[serde(default)]
    pub artifact: Option<String>,

    /// Artifact to download
    #[serde(default)]
    pub download: Option<String>,

    /// Destination directory for `download` (defaults to the artifact name)
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub copy_files: Option<CopyFilesConfig>,

    #[serde(default)]
    pub ssh: Option<SshStepConfig>,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub working_directory: Option<String>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    /// Timeout for a single attempt (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Keep running the job when this step fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Extra attempts after a failure
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyFilesConfig {
    pub connection: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshStepConfig {
    pub connection: String,
    pub inline: String,
}

/// Scalars are accepted wherever a string value is expected
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn parse_variables(raw: &HashMap<String, Value>) -> HashMap<String, VariableDefinition> {
    let mut vars = HashMap::new();

    for (key, value) in raw {
        let var_def = match value {
            Value::Mapping(map) => {
                // file variable: { path: "...", validate_exists: true/false }
                let path = map
                    .get(&Value::String("path".to_string()))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                let validate_exists = map
                    .get(&Value::String("validate_exists".to_string()))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                VariableDefinition::File {
                    path,
                    validate_exists,
                }
            }
            other => VariableDefinition::String(
                scalar_to_string(other)
                    .unwrap_or_else(|| serde_yaml::to_string(other).unwrap_or_default()),
            ),
        };
        vars.insert(key.clone(), var_def);
    }

    vars
}

fn as_string_map(raw: &HashMap<String, Value>) -> HashMap<String, String> {
    parse_variables(raw)
        .into_iter()
        .map(|(k, v)| (k, v.render_value()))
        .collect()
}

impl StageConfig {
    pub fn get_variables(&self) -> HashMap<String, VariableDefinition> {
        parse_variables(&self.variables)
    }

    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        as_string_map(&self.variables)
    }

    /// Parsed run condition
    pub fn parsed_condition(&self) -> Result<Condition> {
        match &self.condition {
            Some(expr) => Condition::parse(expr)
                .with_context(|| format!("Stage '{}' has an invalid condition '{}'", self.stage, expr)),
            None => Ok(Condition::default()),
        }
    }
}

impl JobConfig {
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        as_string_map(&self.variables)
    }
}

impl StepConfig {
    /// Names of the action keys set on this step
    fn actions(&self) -> Vec<&'static str> {
        let mut actions = Vec::new();
        if self.script.is_some() {
            actions.push("script");
        }
        if self.publish.is_some() {
            actions.push("publish");
        }
        if self.download.is_some() {
            actions.push("download");
        }
        if self.copy_files.is_some() {
            actions.push("copy_files");
        }
        if self.ssh.is_some() {
            actions.push("ssh");
        }
        actions
    }

    /// Connection the step uses, if any
    pub fn connection(&self) -> Option<&str> {
        self.copy_files
            .as_ref()
            .map(|c| c.connection.as_str())
            .or_else(|| self.ssh.as_ref().map(|s| s.connection.as_str()))
    }

    /// Environment variables, scalar values converted to strings
    pub fn env_map(&self) -> Result<BTreeMap<String, String>> {
        self.env
            .iter()
            .map(|(key, value)| match scalar_to_string(value) {
                Some(v) => Ok((key.clone(), v)),
                None => bail!("Environment variable '{}' must be a scalar value", key),
            })
            .collect()
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse pipeline YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("Pipeline '{}' has no stages", self.name);
        }

        // Check that all stage IDs are unique
        let mut seen_ids = HashSet::new();
        for stage in &self.stages {
            if !seen_ids.insert(stage.stage.as_str()) {
                bail!("Duplicate stage ID: {}", stage.stage);
            }
        }

        for (name, connection) in &self.connections {
            if connection.host.trim().is_empty() || connection.user.trim().is_empty() {
                bail!("Connection '{}' needs both a host and a user", name);
            }
        }

        for stage in &self.stages {
            if stage.jobs.is_empty() {
                bail!("Stage '{}' has no jobs", stage.stage);
            }

            for dep in &stage.depends_on {
                if !seen_ids.contains(dep.as_str()) {
                    bail!("Stage '{}' depends on non-existent stage '{}'", stage.stage, dep);
                }
            }

            let mut job_ids = HashSet::new();
            for job in &stage.jobs {
                if !job_ids.insert(job.job.as_str()) {
                    bail!("Duplicate job ID '{}' in stage '{}'", job.job, stage.stage);
                }
                for (index, step) in job.steps.iter().enumerate() {
                    self.validate_step(step)
                        .with_context(|| format!("Invalid step {} in job '{}.{}'", index + 1, stage.stage, job.job))?;
                }
            }
        }

        // Cycles first: ancestry below assumes an acyclic graph
        self.check_cycles()?;

        for stage in &self.stages {
            let condition = stage.parsed_condition()?;
            let upstream = self.upstream_of(&stage.stage);
            for referenced in condition.referenced_stages() {
                if !upstream.contains(referenced) {
                    bail!(
                        "Condition of stage '{}' references '{}', which is not one of its dependencies",
                        stage.stage,
                        referenced
                    );
                }
            }
        }

        self.check_artifacts()?;

        // Validate file existence for variables with validate_exists: true
        for (var_name, var_def) in self.get_variables() {
            if let VariableDefinition::File {
                path,
                validate_exists: true,
            } = &var_def
            {
                if !Path::new(path).exists() {
                    bail!(
                        "Variable '{}' references file that doesn't exist: {}",
                        var_name,
                        path
                    );
                }
            }
        }

        Ok(())
    }

    fn validate_step(&self, step: &StepConfig) -> Result<()> {
        let actions = step.actions();
        match actions.len() {
            0 => bail!("Step has no action (expected one of script, publish, download, copy_files, ssh)"),
            1 => {}
            _ => bail!("Step has more than one action: {}", actions.join(", ")),
        }

        if step.publish.is_some() {
            match &step.artifact {
                Some(name) => validate_name(name)?,
                None => bail!("'publish' step needs an 'artifact' name"),
            }
        } else if step.artifact.is_some() {
            bail!("'artifact' is only valid on a 'publish' step");
        }

        if step.path.is_some() && step.download.is_none() {
            bail!("'path' is only valid on a 'download' step");
        }

        if let Some(connection) = step.connection() {
            if !self.connections.contains_key(connection) {
                bail!("Step uses unknown connection '{}'", connection);
            }
        }

        step.env_map()?;
        Ok(())
    }

    /// Every download must name an artifact published earlier in the same
    /// stage or by a stage it transitively depends on
    fn check_artifacts(&self) -> Result<()> {
        let mut publishers: HashMap<&str, &str> = HashMap::new();
        for stage in &self.stages {
            for step in stage.jobs.iter().flat_map(|j| j.steps.iter()) {
                if let Some(name) = &step.artifact {
                    if let Some(other) = publishers.insert(name.as_str(), stage.stage.as_str()) {
                        bail!(
                            "Artifact '{}' is published more than once (stages '{}' and '{}')",
                            name,
                            other,
                            stage.stage
                        );
                    }
                }
            }
        }

        for stage in &self.stages {
            let upstream = self.upstream_of(&stage.stage);
            let mut published_here = HashSet::new();

            for step in stage.jobs.iter().flat_map(|j| j.steps.iter()) {
                if let Some(name) = &step.artifact {
                    published_here.insert(name.as_str());
                }
                let Some(name) = &step.download else {
                    continue;
                };
                match publishers.get(name.as_str()) {
                    None => bail!(
                        "Stage '{}' downloads artifact '{}', which no stage publishes",
                        stage.stage,
                        name
                    ),
                    Some(publisher) if *publisher == stage.stage => {
                        if !published_here.contains(name.as_str()) {
                            bail!(
                                "Stage '{}' downloads artifact '{}' before publishing it",
                                stage.stage,
                                name
                            );
                        }
                    }
                    Some(publisher) if !upstream.contains(publisher) => bail!(
                        "Stage '{}' downloads artifact '{}' from stage '{}', which it does not depend on",
                        stage.stage,
                        name,
                        publisher
                    ),
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Stages `stage_id` depends on, directly or transitively
    pub fn upstream_of(&self, stage_id: &str) -> HashSet<&str> {
        let mut upstream = HashSet::new();
        let mut pending = vec![stage_id];

        while let Some(id) = pending.pop() {
            if let Some(stage) = self.stages.iter().find(|s| s.stage == id) {
                for dep in &stage.depends_on {
                    if upstream.insert(dep.as_str()) {
                        pending.push(dep);
                    }
                }
            }
        }

        upstream
    }

    /// Check for cycles in the stage dependency graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for stage in &self.stages {
            if !visited.contains(&stage.stage) {
                self.dfs_check(&stage.stage, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        stage_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(stage_id.to_string());
        recursion_stack.insert(stage_id.to_string());

        if let Some(stage) = self.stages.iter().find(|s| s.stage == stage_id) {
            for dep in &stage.depends_on {
                if recursion_stack.contains(dep) {
                    bail!("Cycle detected in dependency graph involving stage '{}'", dep);
                }
                if !visited.contains(dep) {
                    self.dfs_check(dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(stage_id);
        Ok(())
    }

    /// Get variables as parsed VariableDefinition enum
    pub fn get_variables(&self) -> HashMap<String, VariableDefinition> {
        parse_variables(&self.variables)
    }

    /// Get variables as a plain string map
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        as_string_map(&self.variables)
    }

    /// Service connections with identity files expanded
    pub fn resolved_connections(&self) -> HashMap<String, Connection> {
        self.connections
            .iter()
            .map(|(name, config)| (name.clone(), config.to_connection(name)))
            .collect()
    }

    pub fn trigger_branches(&self) -> Vec<String> {
        self.trigger
            .as_ref()
            .map(|t| t.branches.clone())
            .unwrap_or_default()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_config(self)
    }
}
