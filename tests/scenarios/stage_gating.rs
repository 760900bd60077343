//! Stage ordering and failure short-circuit

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;

#[tokio::test]
async fn test_failed_stage_stops_dependents() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "three-stages"
stages:
  - stage: Build
    jobs:
      - job: BuildJob
        steps:
          - script: "echo built > build.txt"
            name: "build"
  - stage: Test
    depends_on: [Build]
    jobs:
      - job: TestJob
        steps:
          - script: "echo testing; exit 3"
            name: "unit tests"
  - stage: Deploy
    depends_on: [Test]
    jobs:
      - job: DeployJob
        steps:
          - script: "touch deployed.txt"
            name: "deploy"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_succeeded(&result, "Build");
    assert_stage_failed(&result, "Test", "exited with code 3");
    assert_stage_skipped(&result, "Deploy");
    assert!(!harness.path("deployed.txt").exists());

    let test = result.step("Test", "unit tests");
    assert_eq!(test.exit_code, Some(3));
    assert!(test.stdout.contains("testing"));

    assert_eq!(result.pipeline.state.succeeded_stages, 1);
    assert_eq!(result.pipeline.state.failed_stages, 1);
    assert_eq!(result.pipeline.state.skipped_stages, 1);
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "diamond"
stages:
  - stage: Build
    jobs: [{ job: J, steps: [{ script: "echo Build >> order.txt" }] }]
  - stage: Test
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "echo Test >> order.txt" }] }]
  - stage: Lint
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "echo Lint >> order.txt" }] }]
  - stage: Deploy
    depends_on: [Test, Lint]
    jobs: [{ job: J, steps: [{ script: "echo Deploy >> order.txt" }] }]
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_eq!(result.started_stages(), vec!["Build", "Test", "Lint", "Deploy"]);
    assert_eq!(harness.read("order.txt"), "Build\nTest\nLint\nDeploy\n");
}

#[tokio::test]
async fn test_declaration_order_does_not_override_dependencies() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "reversed"
stages:
  - stage: Deploy
    depends_on: [Build]
    jobs: [{ job: J, steps: [{ script: "echo Deploy >> order.txt" }] }]
  - stage: Build
    jobs: [{ job: J, steps: [{ script: "echo Build >> order.txt" }] }]
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_eq!(harness.read("order.txt"), "Build\nDeploy\n");
}

#[tokio::test]
async fn test_failing_step_stops_its_job_and_stage() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "stop-early"
stages:
  - stage: Build
    jobs:
      - job: Compile
        steps:
          - script: "false"
            name: "compile"
          - script: "touch after-step"
            name: "package"
      - job: Docs
        steps:
          - script: "touch docs-built"
            name: "docs"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_failed(&result, "Build", "Step 'compile' failed");
    assert!(!harness.path("after-step").exists());
    assert!(!harness.path("docs-built").exists());

    let stage = result.pipeline.stage("Build").unwrap();
    assert_eq!(stage.job_outcomes.len(), 1);
    assert_eq!(stage.job_outcomes[0].steps.len(), 1);
}

#[tokio::test]
async fn test_independent_branch_keeps_running_after_failure() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "two-roots"
stages:
  - stage: Backend
    jobs: [{ job: J, steps: [{ script: "exit 1" }] }]
  - stage: Frontend
    jobs: [{ job: J, steps: [{ script: "touch frontend" }] }]
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_succeeded(&result, "Frontend");
    assert!(harness.path("frontend").exists());
}
