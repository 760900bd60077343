//! Cancelling a run between steps

use crate::helpers::*;
use stagecoach::core::{ExecutionStatus, StageState};
use stagecoach::execution::ExecutionEvent;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_cancel_stops_before_next_step() {
    let harness = Harness::new();
    let mut pipeline = pipeline_from_yaml(
        r#"
name: "interrupted"
stages:
  - stage: Build
    jobs:
      - job: J
        steps:
          - script: "touch first"
            name: "first"
          - script: "touch second"
            name: "second"
  - stage: Test
    depends_on: [Build]
    condition: "always()"
    jobs: [{ job: J, steps: [{ script: "touch tested" }] }]
"#,
    );

    let engine = harness.engine();
    let flag = engine.cancellation_flag();
    engine
        .add_event_handler(move |event| {
            if let ExecutionEvent::StepCompleted { step_name, .. } = event {
                if step_name == "first" {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        })
        .await;

    let status = engine.execute(&mut pipeline).await.unwrap();

    assert_eq!(status, ExecutionStatus::Cancelled);
    assert_eq!(pipeline.state.status, ExecutionStatus::Cancelled);
    assert!(harness.path("first").exists());
    assert!(!harness.path("second").exists());
    assert!(!harness.path("tested").exists());

    match &pipeline.stage("Build").unwrap().state {
        StageState::Failed { error, .. } => assert!(error.contains("Cancelled")),
        other => panic!("Build should have been interrupted, was {:?}", other),
    }
    assert!(matches!(
        pipeline.stage("Test").unwrap().state,
        StageState::Skipped { .. }
    ));
}
