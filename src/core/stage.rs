//! Stage and job domain models

use crate::core::{
    condition::Condition,
    config::{JobConfig, StageConfig},
    state::{JobOutcome, StageState},
    step::Step,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A unit of sequential steps within a stage
#[derive(Debug, Clone)]
pub struct Job {
    /// Job identifier, unique within its stage
    pub id: String,

    pub display_name: Option<String>,

    /// Cap on the total time of all steps
    pub timeout: Duration,

    /// Job variables (override stage variables)
    pub variables: HashMap<String, String>,

    pub steps: Vec<Step>,
}

impl Job {
    pub fn from_config(config: &JobConfig, default_timeout_secs: u64) -> Result<Self> {
        let steps = config
            .steps
            .iter()
            .map(Step::from_config)
            .collect::<Result<Vec<_>>>()?;

        Ok(Job {
            id: config.job.clone(),
            display_name: config.display_name.clone(),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(default_timeout_secs)),
            variables: config.variables_as_string_map(),
            steps,
        })
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// A named phase of a pipeline
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique stage identifier
    pub id: String,

    pub display_name: Option<String>,

    /// Stages this stage depends on
    pub dependencies: Vec<String>,

    /// When the stage runs, given the results of its dependencies
    pub condition: Condition,

    /// Stage variables (override pipeline variables)
    pub variables: HashMap<String, String>,

    pub jobs: Vec<Job>,

    /// Runtime state
    pub state: StageState,

    /// Outcomes of the jobs that ran
    pub job_outcomes: Vec<JobOutcome>,
}

impl Stage {
    /// Create a stage from a stage config
    pub fn from_config(config: &StageConfig, default_timeout_secs: u64) -> Result<Self> {
        let jobs = config
            .jobs
            .iter()
            .map(|job| Job::from_config(job, default_timeout_secs))
            .collect::<Result<Vec<_>>>()?;

        Ok(Stage {
            id: config.stage.clone(),
            display_name: config.display_name.clone(),
            dependencies: config.depends_on.clone(),
            condition: config.parsed_condition()?,
            variables: config.variables_as_string_map(),
            jobs,
            state: StageState::Pending,
            job_outcomes: Vec::new(),
        })
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Check if every dependency has finished
    pub fn dependencies_met(&self, finished: &HashSet<&str>) -> bool {
        self.dependencies
            .iter()
            .all(|dep| finished.contains(dep.as_str()))
    }

    /// Total number of steps across all jobs
    pub fn step_count(&self) -> usize {
        self.jobs.iter().map(|j| j.steps.len()).sum()
    }
}
