//! Artifacts flowing from one stage to the next

use crate::helpers::*;
use stagecoach::artifact::ArtifactStore;
use stagecoach::core::ExecutionStatus;
use stagecoach::execution::ExecutionEvent;

const YAML: &str = r#"
name: "build-and-ship"
variables:
  app_dir: "webapp"
stages:
  - stage: Build
    jobs:
      - job: BuildJob
        steps:
          - script: |
              mkdir -p build/static
              printf 'bundle\000binary\n' > build/static/app.js
              echo '<html></html>' > build/index.html
              cp build/index.html build/copy.html
            name: "build"
            working_directory: "{{ app_dir }}"
          - publish: "{{ app_dir }}/build"
            artifact: "drop"
  - stage: Deploy
    depends_on: [Build]
    jobs:
      - job: DeployJob
        steps:
          - download: "drop"
            path: "release"
          - script: "ls -R release > listing.txt"
            name: "inspect"
"#;

#[tokio::test]
async fn test_artifact_arrives_byte_identical() {
    let harness = Harness::new();
    std::fs::create_dir_all(harness.path("webapp")).unwrap();

    let result = harness.run(YAML).await;
    assert_pipeline_status(&result, ExecutionStatus::Completed);

    for file in ["static/app.js", "index.html", "copy.html"] {
        let built = std::fs::read(harness.path(&format!("webapp/build/{}", file))).unwrap();
        let shipped = std::fs::read(harness.path(&format!("release/{}", file))).unwrap();
        assert_eq!(built, shipped, "{} changed in transit", file);
    }
    assert!(harness.read("listing.txt").contains("app.js"));
}

#[tokio::test]
async fn test_artifact_events_and_dedup() {
    let harness = Harness::new();
    std::fs::create_dir_all(harness.path("webapp")).unwrap();

    let result = harness.run(YAML).await;
    assert_pipeline_status(&result, ExecutionStatus::Completed);

    let published = result.events.iter().find_map(|event| match event {
        ExecutionEvent::ArtifactPublished { name, file_count, .. } => Some((name.clone(), *file_count)),
        _ => None,
    });
    assert_eq!(published, Some(("drop".to_string(), 3)));
    assert!(result.events.iter().any(|event| matches!(
        event,
        ExecutionEvent::ArtifactDownloaded { name, file_count: 3 } if name == "drop"
    )));

    // index.html and copy.html share content, so only two blobs exist
    let blobs = std::fs::read_dir(harness.store.path().join("blobs"))
        .unwrap()
        .count();
    assert_eq!(blobs, 2);

    let manifests = harness
        .artifacts()
        .list(result.pipeline.state.execution_id)
        .await
        .unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].name, "drop");
}

#[tokio::test]
async fn test_missing_publish_source_fails_the_stage() {
    let harness = Harness::new();
    let result = harness
        .run(
            r#"
name: "nothing-built"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - publish: "dist"
            artifact: "drop"
  - stage: Deploy
    depends_on: [Build]
    jobs:
      - job: J
        steps:
          - download: "drop"
"#,
        )
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_stage_failed(&result, "Build", "not found");
    assert_stage_skipped(&result, "Deploy");
}
