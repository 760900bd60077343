//! Stage scheduler - decides which stage runs next

use crate::core::{ConditionScope, Pipeline};

/// What to do with the next stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Run the stage
    Run(String),

    /// Mark the stage skipped without running it
    Skip { stage_id: String, reason: String },
}

/// Picks stages one at a time in execution order
#[derive(Debug, Default)]
pub struct StageScheduler;

impl StageScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Decide about the first ready stage, if any
    ///
    /// A stage is ready when it is pending and all of its dependencies have
    /// finished. Its condition is evaluated against their results.
    pub fn next(&self, pipeline: &Pipeline) -> Option<ScheduleDecision> {
        let stage = pipeline.ready_stages().into_iter().next()?;

        let context = pipeline.create_context_for_stage(&stage.id);
        let results = pipeline.stage_results();
        let scope = ConditionScope {
            dependencies: &stage.dependencies,
            results: &results,
            variables: &context.variables,
        };

        if stage.condition.evaluate(&scope) {
            Some(ScheduleDecision::Run(stage.id.clone()))
        } else {
            Some(ScheduleDecision::Skip {
                stage_id: stage.id.clone(),
                reason: format!("condition '{}' was not met", stage.condition),
            })
        }
    }
}
