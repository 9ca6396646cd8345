//! Test: Concurrency groups cap jobs across steps

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::JobState;
use std::time::Duration;

#[tokio::test]
async fn test_group_limit_serializes_jobs() {
    let launcher = MockLauncher::new(|_| JobOutcome::pass().with_delay(Duration::from_millis(40)));
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: deploy-a
    command: ./deploy a
    concurrency_group: prod-deploy
    concurrency: 1
  - label: deploy-b
    command: ./deploy b
    concurrency_group: prod-deploy
    concurrency: 1
  - label: deploy-c
    command: ./deploy c
    concurrency_group: prod-deploy
    concurrency: 1
"#,
        &launcher,
        |c| c.with_workers(3),
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.count(JobState::Passed), 3);
    assert_eq!(launcher.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_group_limit_above_one() {
    let launcher = MockLauncher::new(|_| JobOutcome::pass().with_delay(Duration::from_millis(40)));
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: migrate
    command: ./migrate
    parallelism: 4
    concurrency_group: db
    concurrency: 2
"#,
        &launcher,
        |c| c.with_workers(4),
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(launcher.executed().len(), 4);
    assert!(launcher.peak_concurrency() <= 2);
}
