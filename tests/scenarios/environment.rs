//! Variables, environment and working directories reaching the process

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;

#[tokio::test]
async fn test_variables_and_env_reach_the_process() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "env-check"
variables:
  app_dir: "webapp"
  node-version: 20
stages:
  - stage: Build
    variables:
      target: "production"
    jobs:
      - job: BuildJob
        steps:
          - script: |
              echo "app=$APP_DIR node=$NODE_VERSION target=$TARGET"
              echo "ci=$CI mode=$MODE"
              echo "stage=$STAGE_NAME job=$JOB_NAME pipeline=$PIPELINE_NAME"
              echo "rendered={{ app_dir }}/{{ target }}"
            name: "show env"
            env:
              CI: true
              MODE: "{{ target }}"
              TARGET: "overridden"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_step_output(&result, "Build", "show env", "app=webapp node=20 target=overridden");
    assert_step_output(&result, "Build", "show env", "ci=true mode=production");
    assert_step_output(&result, "Build", "show env", "stage=Build job=BuildJob pipeline=env-check");
    assert_step_output(&result, "Build", "show env", "rendered=webapp/production");

    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "run-id"
stages:
  - stage: Build
    jobs: [{ job: J, steps: [{ script: "echo $RUN_ID", name: "id" }] }]
"#,
        )
        .await;
    let step = result.step("Build", "id");
    assert_eq!(step.stdout.trim(), result.pipeline.state.execution_id.to_string());
}

#[tokio::test]
async fn test_path_variable_does_not_replace_process_path() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "reserved"
variables:
  path: "dist"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "mkdir -p {{ path }} && ls -d {{ path }}"
            name: "uses path"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_step_output(&result, "Build", "uses path", "dist");
}

#[tokio::test]
async fn test_working_directory_resolves_against_workspace() {
    let harness = Harness::new();
    harness.write("webapp/package.json", "{}");

    let result = harness
        .run(
            r#"
name: "workdir"
variables:
  app_dir: "webapp"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "ls && pwd"
            name: "where"
            working_directory: "{{ app_dir }}"
          - script: "pwd"
            name: "root"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_step_output(&result, "Build", "where", "package.json");

    let expected = harness.path("webapp").canonicalize().unwrap();
    let reported = std::path::PathBuf::from(result.step("Build", "where").stdout.lines().last().unwrap());
    assert_eq!(reported.canonicalize().unwrap(), expected);

    let root = std::path::PathBuf::from(result.step("Build", "root").stdout.trim());
    assert_eq!(
        root.canonicalize().unwrap(),
        harness.workspace.path().canonicalize().unwrap()
    );
}

#[tokio::test]
async fn test_missing_working_directory_fails_the_step() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "no-such-dir"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "touch should-not-exist"
            name: "build"
            working_directory: "missing"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    let step = result.step("Build", "build");
    assert!(!step.success);
    assert!(step.exit_code.is_none());
    assert!(step.error.as_deref().unwrap_or("").contains("missing"));
}
