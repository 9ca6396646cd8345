//! Test: Dynamic pipeline uploads splice jobs into a running build

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::JobState;

const GENERATOR: &str = r#"
steps:
  - label: generate
    command: buildkite-agent pipeline upload
  - wait
  - label: finalize
    command: ./finalize.sh
"#;

#[tokio::test]
async fn test_uploaded_steps_run_before_later_steps() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "generate" => JobOutcome::pass().with_upload(
            "steps:\n  - label: generated-1\n    command: echo 1\n  - label: generated-2\n    command: echo 2\n",
        ),
        _ => JobOutcome::pass(),
    });
    let (summary, workspace) = run_pipeline_with_mock(GENERATOR, &launcher, |c| c).await;

    assert_eq!(launcher.upload_statuses(), vec![200]);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.jobs.len(), 5);
    assert_job_state(&summary, "generated-1", JobState::Passed);
    assert_job_state(&summary, "generated-2", JobState::Passed);

    assert_finished_before(&launcher, "generate", "generated-1");
    assert_finished_before(&launcher, "generated-1", "finalize");
    assert_finished_before(&launcher, "generated-2", "finalize");
    assert!(workspace.output.text().contains("Pipeline upload added 2 jobs"));
}

#[tokio::test]
async fn test_uploaded_steps_see_pipeline_env() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "generate" => JobOutcome::pass().with_upload(
            "env:\n  STAGE: uploaded\nsteps:\n  - label: child\n    command: env\n",
        ),
        _ => JobOutcome::pass(),
    });
    let (_, _) = run_pipeline_with_mock(GENERATOR, &launcher, |c| c.with_env("AMBIENT", "yes")).await;

    let child = launcher.find("child").expect("child ran");
    assert_eq!(child.job.env["STAGE"], "uploaded");
    assert_eq!(child.job.env["AMBIENT"], "yes");
}

#[tokio::test]
async fn test_invalid_upload_is_rejected_without_failing_the_build() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "generate" => JobOutcome::pass().with_upload("steps: [unclosed"),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(GENERATOR, &launcher, |c| c).await;

    assert_eq!(launcher.upload_statuses(), vec![400]);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.jobs.len(), 3);
    assert_job_state(&summary, "finalize", JobState::Passed);
}

#[tokio::test]
async fn test_unplannable_upload_returns_server_error() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "generate" => JobOutcome::pass()
            .with_upload("steps:\n  - label: orphan\n    command: x\n    depends_on: missing-key\n"),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(GENERATOR, &launcher, |c| c).await;

    assert_eq!(launcher.upload_statuses(), vec![500]);
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.job("orphan").is_none());
}

#[tokio::test]
async fn test_upload_can_depend_on_existing_keys() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "generate" => JobOutcome::pass().with_upload(
            "steps:\n  - label: uses-build\n    command: x\n    depends_on: build\n",
        ),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: build
    key: build
    command: make
  - label: generate
    command: buildkite-agent pipeline upload
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(launcher.upload_statuses(), vec![200]);
    assert_job_state(&summary, "uses-build", JobState::Passed);
    assert_finished_before(&launcher, "build", "uses-build");
}

#[tokio::test]
async fn test_upload_cannot_wait_on_jobs_that_wait_on_the_uploader() {
    let launcher = MockLauncher::new(|job| match job.label.as_str() {
        "boot" => JobOutcome::pass().with_upload(
            "steps:\n  - label: notify\n    command: x\n    depends_on: deploy\n",
        ),
        _ => JobOutcome::pass(),
    });
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: boot
    key: boot
    command: buildkite-agent pipeline upload
  - label: deploy
    key: deploy
    command: ./deploy.sh
    depends_on: boot
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(launcher.upload_statuses(), vec![500]);
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.job("notify").is_none());
    assert_job_state(&summary, "deploy", JobState::Passed);
    assert_finished_before(&launcher, "boot", "deploy");
}
