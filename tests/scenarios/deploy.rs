//! Deploy stages reaching a VM through a service connection

use crate::helpers::*;
use stagecoach::core::ExecutionStatus;

const YAML: &str = r#"
name: "react-webapp"
variables:
  web_root: "/var/www/html"
  restart: "sudo systemctl restart nginx"
connections:
  prod-vm:
    host: "203.0.113.10"
    user: "azureuser"
    identity_file: "~/.ssh/deploy_key"
stages:
  - stage: Build
    jobs:
      - job: BuildJob
        steps:
          - script: "mkdir -p build && echo '<html></html>' > build/index.html && echo 'body{}' > build/site.css"
            name: "build"
          - publish: "build"
            artifact: "drop"
  - stage: Deploy
    depends_on: [Build]
    jobs:
      - job: DeployJob
        steps:
          - download: "drop"
            path: "release"
          - copy_files:
              connection: "prod-vm"
              source: "release"
              target: "{{ web_root }}"
          - ssh:
              connection: "prod-vm"
              inline: "{{ restart }}"
"#;

#[tokio::test]
async fn test_deploy_uploads_and_restarts() {
    let harness = Harness::new();
    let result = harness.run(YAML).await;

    assert_pipeline_status(&result, ExecutionStatus::Completed);
    assert_eq!(
        harness.remote.calls(),
        vec![
            RemoteCall::Upload {
                connection: "prod-vm".to_string(),
                files: vec!["index.html".to_string(), "site.css".to_string()],
                remote_dir: "/var/www/html".to_string(),
            },
            RemoteCall::Run {
                connection: "prod-vm".to_string(),
                command: "sudo systemctl restart nginx".to_string(),
            },
        ]
    );
    assert_step_output(&result, "Deploy", "Run on prod-vm", "ran on 203.0.113.10");
}

#[tokio::test]
async fn test_failed_remote_command_fails_deploy() {
    let harness = Harness::new();
    let result = harness
        .run_with(YAML, |pipeline| {
            pipeline.override_variables([("restart".to_string(), "exit 1".to_string())].into());
        })
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_succeeded(&result, "Build");
    assert_stage_failed(&result, "Deploy", "remote command exited with code 1");
}

#[tokio::test]
async fn test_no_remote_calls_when_build_fails() {
    let harness = Harness::new();
    let yaml = YAML.replace("echo 'body{}' > build/site.css", "exit 2");
    let result = harness.run(&yaml).await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_skipped(&result, "Deploy");
    assert!(harness.remote.calls().is_empty());
}
