//! Test: Wait barriers - ordering and failure behavior around `wait`

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::{JobId, JobState, StepKind};
use std::time::Duration;

const BARRIER: &str = r#"
steps:
  - label: lint
    command: make lint
  - label: unit
    command: make test
  - wait
  - label: package
    command: make package
"#;

#[tokio::test]
async fn test_wait_orders_jobs() {
    // slow the first wave down so an ordering bug would show
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "package" => JobOutcome::pass(),
        _ => JobOutcome::pass().with_delay(Duration::from_millis(100)),
    });
    let (summary, _) = run_pipeline_with_mock(BARRIER, &launcher, |c| c).await;

    assert_eq!(summary.exit_code(), 0);
    assert_finished_before(&launcher, "lint", "package");
    assert_finished_before(&launcher, "unit", "package");
    assert!(launcher.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_barrier_timestamps() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "C" | "D" => JobOutcome::pass(),
        _ => JobOutcome::pass().with_delay(Duration::from_millis(50)),
    });
    let (summary, _) = run_pipeline_with_mock(
        "steps:\n  - { label: A, command: a }\n  - { label: B, command: b }\n  - wait\n  - { label: C, command: c }\n  - { label: D, command: d }\n",
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.jobs.len(), 5);
    assert_dependencies_ended_first(&summary);

    let wait = summary
        .jobs
        .iter()
        .find(|j| j.kind == StepKind::Wait)
        .expect("wait job");
    let wait_ended = wait.ended_at.expect("wait ended");
    let deps_of = |id: &JobId| {
        summary
            .edges
            .iter()
            .filter(|(dependent, _)| dependent == id)
            .map(|(_, dependency)| summary.job_by_id(dependency).unwrap().name.clone())
            .collect::<Vec<_>>()
    };
    let mut wait_deps = deps_of(&wait.id);
    wait_deps.sort();
    assert_eq!(wait_deps, vec!["A", "B"]);

    for label in ["A", "B", "C", "D"] {
        let job = summary.job(label).unwrap();
        let (started, ended) = (job.started_at.unwrap(), job.ended_at.unwrap());
        assert!(started <= ended, "{label}");
        if label == "C" || label == "D" {
            assert_eq!(deps_of(&job.id), vec!["wait"]);
            assert!(started >= wait_ended, "{label} started before the wait ended");
        }
    }
}

#[tokio::test]
async fn test_failure_before_wait_breaks_later_jobs() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "unit" => JobOutcome::exit(1),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(BARRIER, &launcher, |c| c).await;

    assert_eq!(summary.exit_code(), 1);
    assert_job_state(&summary, "lint", JobState::Passed);
    assert_job_state(&summary, "unit", JobState::Failed);
    assert_job_state(&summary, "package", JobState::Broken);
    assert!(launcher.find("package").is_none());
}

#[tokio::test]
async fn test_continue_on_failure_wait() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "unit" => JobOutcome::exit(1),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: unit
    command: make test
  - wait: ~
    continue_on_failure: true
  - label: report
    command: ./report.sh
"#,
        &launcher,
        |c| c,
    )
    .await;

    // the failure still fails the run, but the report runs
    assert_eq!(summary.exit_code(), 1);
    assert_job_state(&summary, "report", JobState::Passed);
    assert_finished_before(&launcher, "unit", "report");
}
