//! Test: Failure cascade - broken dependents and tolerated failures

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::JobState;

fn failing(label: &'static str) -> MockLauncher {
    MockLauncher::new(move |job| {
        if job.label == label {
            JobOutcome::exit(1)
        } else {
            JobOutcome::pass()
        }
    })
}

#[tokio::test]
async fn test_cascade_through_depends_on() {
    let launcher = failing("compile");
    let (summary, workspace) = run_pipeline_with_mock(
        r#"
steps:
  - label: compile
    key: compile
    command: make
  - label: test
    key: test
    command: make test
    depends_on: compile
  - label: deploy
    command: make deploy
    depends_on: test
  - label: docs
    command: make docs
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 1);
    assert_job_state(&summary, "compile", JobState::Failed);
    assert_job_state(&summary, "test", JobState::Broken);
    assert_job_state(&summary, "deploy", JobState::Broken);
    assert_job_state(&summary, "docs", JobState::Passed);
    assert_eq!(summary.count(JobState::Broken), 2);

    let mut ran = launcher.executed_labels();
    ran.sort();
    assert_eq!(ran, vec!["compile", "docs"]);
    assert!(workspace.output.text().contains("BROKEN"));
}

#[tokio::test]
async fn test_allow_failure_dependency_runs() {
    let launcher = failing("flaky");
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: flaky
    key: flaky
    command: ./flaky.sh
  - label: cleanup
    command: ./cleanup.sh
    depends_on:
      - step: flaky
        allow_failure: true
  - label: strict
    command: ./strict.sh
    depends_on: flaky
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 1);
    assert_job_state(&summary, "cleanup", JobState::Passed);
    assert_job_state(&summary, "strict", JobState::Broken);
    assert_finished_before(&launcher, "flaky", "cleanup");
}

#[tokio::test]
async fn test_step_level_allow_dependency_failure() {
    let launcher = failing("flaky");
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: flaky
    key: flaky
    command: ./flaky.sh
  - label: notify
    command: ./notify.sh
    depends_on: flaky
    allow_dependency_failure: true
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_job_state(&summary, "notify", JobState::Passed);
}
