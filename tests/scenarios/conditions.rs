//! Stage conditions: failed(), always() and variable comparisons

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;

const YAML: &str = r#"
name: "with-handlers"
variables:
  build_result: "0"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "exit $BUILD_RESULT"
            name: "build"
  - stage: Test
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "touch tested" }] }]
  - stage: Notify
    depends_on: [Build]
    condition: "failed()"
    jobs: [{ job: J, steps: [{ script: "touch notified" }] }]
  - stage: Cleanup
    depends_on: [Test, Notify]
    condition: "always()"
    jobs: [{ job: J, steps: [{ script: "touch cleaned" }] }]
"#;

#[tokio::test]
async fn test_failure_handlers_run_after_failure() {
    let harness = Harness::new();
    let result = harness
        .run_with(YAML, |pipeline| {
            pipeline.override_variables([("build_result".to_string(), "1".to_string())].into());
        })
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_failed(&result, "Build", "exited with code 1");
    assert_stage_skipped(&result, "Test");
    assert_stage_succeeded(&result, "Notify");
    assert_stage_succeeded(&result, "Cleanup");
    assert!(!harness.path("tested").exists());
    assert!(harness.path("notified").exists());
    assert!(harness.path("cleaned").exists());
}

#[tokio::test]
async fn test_failure_handlers_skipped_on_success() {
    let harness = Harness::new();
    let result = harness.run(YAML).await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_stage_succeeded(&result, "Test");
    assert_stage_skipped(&result, "Notify");
    assert_stage_succeeded(&result, "Cleanup");
    assert!(!harness.path("notified").exists());
    assert!(harness.path("cleaned").exists());
}

#[tokio::test]
async fn test_skipped_stage_short_circuits_downstream() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "chain"
stages:
  - stage: A
    condition: "eq(variables.run_a, 'yes')"
    jobs: [{ job: J, steps: [{ script: "touch a" }] }]
  - stage: B
    depends_on: [A]
    jobs: [{ job: J, steps: [{ script: "touch b" }] }]
  - stage: C
    depends_on: [B]
    condition: "succeededOrFailed()"
    jobs: [{ job: J, steps: [{ script: "touch c" }] }]
"#,
        )
        .await;

    // Skips are not failures
    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_stage_skipped(&result, "A");
    assert_stage_skipped(&result, "B");
    assert_stage_skipped(&result, "C");
    assert!(result.started_stages().is_empty());
}

#[tokio::test]
async fn test_variable_condition_gates_deploy() {
    let yaml = r#"
name: "env-gated"
variables:
  environment: "prod"
stages:
  - stage: Build
    jobs: [{ job: J, steps: [{ script: "true" }] }]
  - stage: Deploy
    depends_on: [Build]
    condition: "and(succeeded(), eq(variables.environment, 'prod'))"
    jobs: [{ job: J, steps: [{ script: "touch deployed" }] }]
"#;

    let harness = Harness::new();
    let result = harness.run(yaml).await;
    assert_stage_succeeded(&result, "Deploy");
    assert!(harness.path("deployed").exists());

    let harness = Harness::new();
    let result = harness
        .run_with(yaml, |pipeline| {
            pipeline.override_variables([("environment".to_string(), "staging".to_string())].into());
        })
        .await;
    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_stage_skipped(&result, "Deploy");
    assert!(!harness.path("deployed").exists());
}
