//! Step and job timeouts

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_step_timeout_kills_and_fails() {
    let harness = Harness::new();
    let start = Instant::now();
    let result = harness
        .run(
            r#"
name: "slow-step"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "sleep 30; touch finished"
            name: "slow"
            timeout_secs: 1
          - script: "touch next"
            name: "next"
"#,
        )
        .await;

    assert!(start.elapsed() < Duration::from_secs(15));
    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_failed(&result, "Build", "timed out after 1 seconds");
    assert!(!harness.path("finished").exists());
    assert!(!harness.path("next").exists());
}

#[tokio::test]
async fn test_job_timeout_caps_the_whole_job() {
    let harness = Harness::new();
    let start = Instant::now();
    let result = harness
        .run(
            r#"
name: "slow-job"
stages:
  - stage: Build
    jobs:
      - job: J
        timeout_secs: 1
        steps:
          - script: "echo quick"
            name: "quick"
          - script: "sleep 30"
            name: "slow"
  - stage: Test
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "true" }] }]
"#,
        )
        .await;

    assert!(start.elapsed() < Duration::from_secs(15));
    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_failed(&result, "Build", "Job 'J' timed out after 1 seconds");
    assert_stage_skipped(&result, "Test");

    // Steps that finished before the deadline are kept
    let job = &result.pipeline.stage("Build").unwrap().job_outcomes[0];
    assert!(!job.success);
    assert_eq!(job.steps.len(), 1);
    assert_eq!(job.steps[0].stdout.trim(), "quick");
}
