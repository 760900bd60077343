//! Pipeline domain model

use crate::core::{
    config::{PipelineConfig, DEFAULT_TIMEOUT_SECS},
    context::PipelineContext,
    stage::Stage,
    state::{ExecutionStatus, PipelineState, StageResult, StageState},
};
use crate::remote::Connection;
use anyhow::Result;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// A pipeline definition: a DAG of stages plus its run state
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all stages
    pub variables: HashMap<String, String>,

    /// Branch patterns the pipeline runs for (empty = any branch)
    pub trigger_branches: Vec<String>,

    /// Service connections, by name
    pub connections: HashMap<String, Connection>,

    /// Pipeline stages
    pub stages: HashMap<String, Stage>,

    /// Execution state
    pub state: PipelineState,

    /// Branch being built, if known
    pub branch: Option<String>,

    /// Stage execution order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let default_timeout = config.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut declared = Vec::with_capacity(config.stages.len());
        let mut stages = HashMap::new();
        for stage_config in &config.stages {
            let stage = Stage::from_config(stage_config, default_timeout)?;
            declared.push(stage.id.clone());
            stages.insert(stage.id.clone(), stage);
        }

        let execution_order = Self::topological_sort(&declared, &stages);

        Ok(Pipeline {
            name: config.name.clone(),
            variables: config.variables_as_string_map(),
            trigger_branches: config.trigger_branches(),
            connections: config.resolved_connections(),
            stages,
            state: PipelineState::new(),
            branch: None,
            execution_order,
        })
    }

    /// Get a stage by ID
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    /// Get a mutable stage by ID
    pub fn stage_mut(&mut self, id: &str) -> Option<&mut Stage> {
        self.stages.get_mut(id)
    }

    /// Override pipeline variables (e.g. from `--variable key=value`)
    pub fn override_variables(&mut self, overrides: HashMap<String, String>) {
        self.variables.extend(overrides);
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.branch = Some(branch.into());
    }

    /// Stages in execution order
    pub fn stages_in_order(&self) -> impl Iterator<Item = &Stage> {
        self.execution_order
            .iter()
            .filter_map(|id| self.stages.get(id))
    }

    /// Pending stages whose dependencies have all finished, in execution order
    pub fn ready_stages(&self) -> Vec<&Stage> {
        let finished: HashSet<&str> = self
            .stages
            .values()
            .filter(|s| s.state.is_terminal())
            .map(|s| s.id.as_str())
            .collect();

        self.stages_in_order()
            .filter(|s| matches!(s.state, StageState::Pending) && s.dependencies_met(&finished))
            .collect()
    }

    /// Results of all finished stages
    pub fn stage_results(&self) -> HashMap<String, StageResult> {
        self.stages
            .values()
            .filter_map(|s| s.state.result().map(|r| (s.id.clone(), r)))
            .collect()
    }

    /// Number of (succeeded, failed, skipped) stages
    pub fn stage_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for stage in self.stages.values() {
            match stage.state.result() {
                Some(StageResult::Succeeded) => counts.0 += 1,
                Some(StageResult::Failed) => counts.1 += 1,
                Some(StageResult::Skipped) => counts.2 += 1,
                None => {}
            }
        }
        counts
    }

    /// Check if every stage has finished
    pub fn is_complete(&self) -> bool {
        self.stages.values().all(|s| s.state.is_terminal())
    }

    /// Check if pipeline has failed
    pub fn has_failed(&self) -> bool {
        self.state.status == ExecutionStatus::Failed
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Check whether the trigger allows a run for `branch`
    pub fn accepts_branch(&self, branch: &str) -> bool {
        self.trigger_branches.is_empty()
            || self
                .trigger_branches
                .iter()
                .any(|pattern| branch_matches(pattern, branch))
    }

    /// Calculate topological sort of stages based on dependencies
    ///
    /// Roots are visited in declaration order, so independent stages keep the
    /// order they were written in.
    fn topological_sort(declared: &[String], stages: &HashMap<String, Stage>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        for stage_id in declared {
            if !visited.contains(stage_id) {
                Self::visit(stage_id, stages, &mut visited, &mut result);
            }
        }

        result
    }

    fn visit(
        stage_id: &str,
        stages: &HashMap<String, Stage>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(stage_id.to_string()) {
            return;
        }

        if let Some(stage) = stages.get(stage_id) {
            for dep in &stage.dependencies {
                Self::visit(dep, stages, visited, result);
            }
        }

        result.push(stage_id.to_string());
    }

    /// Create execution context for a stage
    pub fn create_context_for_stage(&self, stage_id: &str) -> PipelineContext {
        let mut context = PipelineContext::new(self.state.execution_id);

        context.variables.extend(self.variables.clone());
        context.connections = self.connections.clone();

        if let Some(stage) = self.stage(stage_id) {
            context.variables.extend(stage.variables.clone());

            for dep in &stage.dependencies {
                if let Some(result) = self.stage(dep).and_then(|s| s.state.result()) {
                    context.dependency_results.insert(dep.clone(), result);
                }
            }
        }

        context.set_variable("pipeline.name", self.name.clone());
        context.set_variable("run.id", self.state.execution_id.to_string());
        context.set_variable("stage.name", stage_id);
        if let Some(branch) = &self.branch {
            context.set_variable("branch", branch.clone());
        }

        context
    }
}

/// Match a branch against a trigger pattern where `*` matches anything
fn branch_matches(pattern: &str, branch: &str) -> bool {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map(|re| re.is_match(branch))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const DIAMOND: &str = r#"
name: "diamond"
trigger:
  branches: ["main", "release/*"]
variables:
  app_dir: "webapp"
stages:
  - stage: Deploy
    depends_on: [Test, Lint]
    variables: { app_dir: "dist" }
    jobs: [{ job: J, steps: [] }]
  - stage: Test
    depends_on: [Build]
    jobs: [{ job: J, steps: [] }]
  - stage: Build
    jobs: [{ job: J, steps: [] }]
  - stage: Lint
    depends_on: [Build]
    jobs: [{ job: J, steps: [] }]
"#;

    fn pipeline() -> Pipeline {
        PipelineConfig::from_yaml(DIAMOND)
            .unwrap()
            .to_pipeline()
            .unwrap()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_topological_sort() {
        let pipeline = pipeline();
        let order = pipeline.execution_order();

        assert_eq!(order.len(), 4);
        assert!(position(order, "Build") < position(order, "Test"));
        assert!(position(order, "Build") < position(order, "Lint"));
        assert!(position(order, "Test") < position(order, "Deploy"));
        assert!(position(order, "Lint") < position(order, "Deploy"));
    }

    #[test]
    fn test_topological_sort_is_deterministic() {
        let expected = pipeline().execution_order().to_vec();
        assert_eq!(expected, vec!["Build", "Test", "Lint", "Deploy"]);
        for _ in 0..10 {
            assert_eq!(pipeline().execution_order(), expected.as_slice());
        }
    }

    #[test]
    fn test_ready_stages() {
        let mut pipeline = pipeline();

        let ready: Vec<&str> = pipeline.ready_stages().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["Build"]);

        let now = Utc::now();
        pipeline.stage_mut("Build").unwrap().state = StageState::Succeeded {
            started_at: now,
            completed_at: now,
        };

        let ready: Vec<&str> = pipeline.ready_stages().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["Test", "Lint"]);

        pipeline.stage_mut("Test").unwrap().state = StageState::Skipped {
            reason: "condition".to_string(),
        };
        let ready: Vec<&str> = pipeline.ready_stages().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["Lint"]);

        assert_eq!(pipeline.stage_counts(), (1, 0, 1));
        assert!(!pipeline.is_complete());
    }

    #[test]
    fn test_context_for_stage() {
        let mut pipeline = pipeline();
        pipeline.set_branch("main");
        let now = Utc::now();
        pipeline.stage_mut("Test").unwrap().state = StageState::Failed {
            error: "boom".to_string(),
            started_at: now,
            failed_at: now,
        };

        let ctx = pipeline.create_context_for_stage("Deploy");
        assert_eq!(ctx.render("{{ app_dir }}"), "dist");
        assert_eq!(ctx.render("{{ stage.name }}@{{ branch }}"), "Deploy@main");
        assert_eq!(ctx.render("{{ pipeline.name }}"), "diamond");
        assert_eq!(
            ctx.get_variable("run.id"),
            Some(&pipeline.state.execution_id.to_string())
        );
        assert_eq!(ctx.dependency_results.get("Test"), Some(&StageResult::Failed));
        assert!(!ctx.dependency_results.contains_key("Lint"));

        let build_ctx = pipeline.create_context_for_stage("Build");
        assert_eq!(build_ctx.render("{{ app_dir }}"), "webapp");
    }

    #[test]
    fn test_variable_overrides() {
        let mut pipeline = pipeline();
        pipeline.override_variables(HashMap::from([(
            "app_dir".to_string(),
            "frontend".to_string(),
        )]));
        let ctx = pipeline.create_context_for_stage("Build");
        assert_eq!(ctx.render("{{ app_dir }}"), "frontend");
    }

    #[test]
    fn test_branch_trigger() {
        let pipeline = pipeline();
        assert!(pipeline.accepts_branch("main"));
        assert!(pipeline.accepts_branch("release/1.2"));
        assert!(!pipeline.accepts_branch("feature/login"));
        assert!(!pipeline.accepts_branch("mainline"));

        let mut any = pipeline.clone();
        any.trigger_branches.clear();
        assert!(any.accepts_branch("feature/login"));
    }

    #[test]
    fn test_branch_pattern_escapes_regex_characters() {
        assert!(branch_matches("v1.0", "v1.0"));
        assert!(!branch_matches("v1.0", "v1x0"));
        assert!(branch_matches("*", "anything"));
    }
}
