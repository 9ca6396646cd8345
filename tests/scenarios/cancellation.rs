//! Test: Cancellation and unaccepted jobs

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::{JobState, Orchestrator, RunOutcome};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_cancel_stops_the_run() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "slow" => JobOutcome::exit(4).with_delay(Duration::from_millis(1500)),
        _ => JobOutcome::pass(),
    });
    let workspace = Workspace::new("steps:\n  - label: slow\n    command: sleep 1\n  - wait\n  - label: never\n    command: x\n");
    let orchestrator = Orchestrator::new(Arc::new(launcher.clone()));

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(20), orchestrator.run(workspace.config()))
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.outcome, RunOutcome::Canceled);
    assert_eq!(summary.exit_code(), 130);
    // Running at cancel time: the agent's own report stands
    assert_job_state(&summary, "slow", JobState::Failed);
    assert_eq!(summary.job("slow").unwrap().exit_code, Some(4));
    assert_job_state(&summary, "never", JobState::Canceled);
    assert_eq!(launcher.executed_labels(), vec!["slow"]);
    assert_all_terminal(&summary);
    assert!(workspace.output.text().contains("Build canceled"));
}

#[tokio::test]
async fn test_unaccepted_job_is_failed() {
    let launcher = MockLauncher::unresponsive();
    let (summary, _) = run_pipeline_with_mock(
        "steps:\n  - label: lost\n    command: x\n  - wait\n  - label: after\n    command: y\n",
        &launcher,
        |c| c.with_accept_timeout(Duration::from_millis(200)),
    )
    .await;

    assert_eq!(summary.exit_code(), 1);
    assert_job_state(&summary, "lost", JobState::Failed);
    assert_job_state(&summary, "after", JobState::Broken);
}
