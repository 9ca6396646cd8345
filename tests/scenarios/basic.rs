//! Test: Basic runs - single jobs, exit codes and job environment

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::{JobState, RunOutcome};

#[tokio::test]
async fn test_single_command_passes() {
    let launcher = MockLauncher::passing();
    let (summary, workspace) = run_pipeline_with_mock(
        "steps:\n  - label: hello\n    key: greet\n    command: echo hello\n",
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.outcome, RunOutcome::Passed);
    assert_eq!(summary.exit_code(), 0);
    assert_job_state(&summary, "hello", JobState::Passed);

    let executed = launcher.find("hello").expect("hello ran");
    assert_eq!(executed.job.command, "echo hello");

    let env = &executed.job.env;
    assert_eq!(env["BUILDKITE_JOB_ID"], executed.job.id);
    assert_eq!(env["BUILDKITE_STEP_KEY"], "greet");
    assert_eq!(env["BUILDKITE_ORGANIZATION_SLUG"], "local");
    assert_eq!(env["BUILDKITE_REPO"], "file:///dev/null");
    assert_eq!(env["BUILDKITE_BRANCH"], "main");
    assert_eq!(env["BUILDKITE_COMMIT"], "0123456789abcdef");
    assert_eq!(env["BUILDKITE_PIPELINE_SLUG"], "builds");
    assert_eq!(
        env["BUILDKITE_BUILD_CHECKOUT_PATH"],
        workspace.dir.path().display().to_string()
    );

    // the mock registered, so the job is attributed to its agent id
    let job = summary.job("hello").unwrap();
    let agent = summary.assignments.get(&job.id).expect("assigned");
    assert_ne!(agent, "unknown");

    let output = workspace.output.text();
    assert!(output.contains("hello"), "{output}");
    assert!(output.contains("Build passed"), "{output}");
}

#[tokio::test]
async fn test_failed_job_fails_the_run() {
    let launcher = MockLauncher::new(|_| JobOutcome::exit(3));
    let (summary, workspace) =
        run_pipeline_with_mock("steps:\n  - label: boom\n    command: exit 3\n", &launcher, |c| c).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.exit_code(), 1);
    let job = summary.job("boom").unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(3));
    assert!(workspace.output.text().contains("Build failed"));
}

#[tokio::test]
async fn test_soft_fail_keeps_the_run_green() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "flaky" => JobOutcome::exit(2),
        "strict" => JobOutcome::exit(1),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: flaky
    command: ./flaky.sh
    soft_fail:
      - exit_status: 2
  - wait
  - label: after
    command: echo after
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_job_state(&summary, "flaky", JobState::Passed);
    assert_job_state(&summary, "after", JobState::Passed);
}

#[tokio::test]
async fn test_env_precedence() {
    let launcher = MockLauncher::passing();
    let (_, _) = run_pipeline_with_mock(
        r#"
env:
  SHARED: pipeline
  PIPELINE_ONLY: "yes"
steps:
  - label: envy
    command: env
    env:
      SHARED: step
      DERIVED: "${PIPELINE_ONLY}-derived"
"#,
        &launcher,
        |c| c.with_env("SHARED", "ambient").with_env("AMBIENT_ONLY", "1"),
    )
    .await;

    let env = launcher.find("envy").unwrap().job.env;
    assert_eq!(env["SHARED"], "step");
    assert_eq!(env["PIPELINE_ONLY"], "yes");
    assert_eq!(env["AMBIENT_ONLY"], "1");
    assert_eq!(env["DERIVED"], "yes-derived");
}

#[tokio::test]
async fn test_agent_is_launched_against_local_endpoint() {
    let launcher = MockLauncher::passing();
    let (summary, workspace) =
        run_pipeline_with_mock("steps:\n  - command: a\n  - command: b\n", &launcher, |c| c).await;

    let launches = launcher.launches();
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert!(launch.endpoint.starts_with("http://127.0.0.1:"));
    assert!(launch.endpoint.ends_with("/v3"));
    assert_eq!(launch.workers, 2);
    assert_eq!(summary.workers, 2);
    assert_eq!(launch.build_dir, workspace.dir.path().join("builds"));
}

#[tokio::test]
async fn test_trigger_and_block_steps_resolve_locally() {
    let launcher = MockLauncher::passing();
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - trigger: deploy-pipeline
    label: deploy
  - block: Release?
  - label: after
    command: echo after
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_job_state(&summary, "deploy", JobState::Skipped);
    assert_job_state(&summary, "after", JobState::Passed);
    assert_eq!(launcher.executed_labels(), vec!["after".to_string()]);
}

#[tokio::test]
async fn test_dry_run_prints_plan() {
    let launcher = MockLauncher::passing();
    let (summary, workspace) = run_pipeline_with_mock(
        "steps:\n  - label: build\n    command: make\n  - wait\n  - label: ship\n    command: ship\n",
        &launcher,
        |c| c.with_dry_run(true),
    )
    .await;

    assert_eq!(summary.outcome, RunOutcome::Planned);
    assert!(launcher.launches().is_empty());
    let output = workspace.output.text();
    assert!(output.contains("3 jobs"), "{output}");
    assert!(output.contains("ship"), "{output}");
    assert!(output.contains("after 2"), "{output}");
}
