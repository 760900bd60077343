//! Step retries and continue_on_error

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;
use stagecoach::execution::ExecutionEvent;

#[tokio::test]
async fn test_flaky_step_succeeds_on_retry() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "flaky"
stages:
  - stage: Test
    jobs:
      - job: J
        steps:
          - script: |
              echo attempt >> attempts.txt
              [ $(wc -l < attempts.txt) -ge 3 ]
            name: "flaky test"
            retries: 3
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    let step = result.step("Test", "flaky test");
    assert!(step.success);
    assert_eq!(step.attempts, 3);
    assert_eq!(harness.read("attempts.txt").lines().count(), 3);

    let retries: Vec<(u32, u32)> = result
        .events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::StepRetrying { attempt, max_attempts, .. } => Some((*attempt, *max_attempts)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(2, 4), (3, 4)]);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "always-fails"
stages:
  - stage: Test
    jobs:
      - job: J
        steps:
          - script: "echo attempt >> attempts.txt; exit 1"
            name: "broken"
            retries: 2
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_eq!(result.step("Test", "broken").attempts, 3);
    assert_eq!(harness.read("attempts.txt").lines().count(), 3);
}

#[tokio::test]
async fn test_continue_on_error_keeps_the_job_going() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "lenient"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "exit 1"
            name: "lint"
            continue_on_error: true
          - script: "touch built"
            name: "build"
  - stage: Deploy
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "touch deployed" }] }]
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    let lint = result.step("Build", "lint");
    assert!(!lint.success);
    assert!(lint.tolerated);
    assert!(harness.path("built").exists());
    assert!(harness.path("deployed").exists());
    assert!(result.events.iter().any(|event| matches!(
        event,
        ExecutionEvent::StepFailed { step_name, tolerated: true, .. } if step_name == "lint"
    )));
}
