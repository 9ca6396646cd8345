//! Test: Matrix builds - expansion, interpolation and adjustments

use crate::helpers::*;
use crate::mock_agent::MockLauncher;
use bk_local::JobState;

#[tokio::test]
async fn test_single_axis_matrix() {
    let launcher = MockLauncher::passing();
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: "test {{matrix}}"
    command: "make test-{{matrix}}"
    matrix:
      - linux
      - darwin
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    assert_job_state(&summary, "test linux", JobState::Passed);
    assert_job_state(&summary, "test darwin", JobState::Passed);

    let darwin = launcher.find("test darwin").unwrap();
    assert_eq!(darwin.job.command, "make test-darwin");
    assert_eq!(darwin.job.env["BUILDKITE_MATRIX_MATRIX"], "darwin");
}

#[tokio::test]
async fn test_multi_axis_matrix_with_adjustments() {
    let launcher = MockLauncher::passing();
    let (summary, _) = run_pipeline_with_mock(
        r#"
steps:
  - label: "{{matrix.os}}/{{matrix.arch}}"
    command: "build --os {{matrix.os}} --arch {{matrix.arch}}"
    matrix:
      setup:
        os: [linux, windows]
        arch: [amd64, arm64]
      adjustments:
        - with: { os: windows, arch: arm64 }
          skip: true
"#,
        &launcher,
        |c| c,
    )
    .await;

    assert_eq!(summary.exit_code(), 0);
    let mut labels = launcher.executed_labels();
    labels.sort();
    assert_eq!(labels, vec!["linux/amd64", "linux/arm64", "windows/amd64"]);
    assert!(summary.job("windows/arm64").is_none());

    let windows = launcher.find("windows/amd64").unwrap();
    assert_eq!(windows.job.command, "build --os windows --arch amd64");
    assert_eq!(windows.job.env["BUILDKITE_MATRIX_OS"], "windows");
}
