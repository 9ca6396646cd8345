//! Test: Parallelism - shards and worker sizing

use crate::helpers::*;
use crate::mock_agent::{JobOutcome, MockLauncher};
use bk_local::JobState;
use std::time::Duration;

const SHARDED: &str = r#"
steps:
  - label: shard
    command: ./run-shard.sh
    parallelism: 3
"#;

#[tokio::test]
async fn test_shards_get_parallel_env() {
    let launcher = MockLauncher::new(|_| JobOutcome::pass().with_delay(Duration::from_millis(50)));
    let (summary, _) = run_pipeline_with_mock(SHARDED, &launcher, |c| c).await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.workers, 3);
    assert_eq!(summary.jobs_named("shard").len(), 3);
    assert_job_state(&summary, "shard", JobState::Passed);

    let mut indices: Vec<String> = launcher
        .executed()
        .iter()
        .map(|j| {
            assert_eq!(j.job.env["BUILDKITE_PARALLEL_JOB_COUNT"], "3");
            j.job.env["BUILDKITE_PARALLEL_JOB"].clone()
        })
        .collect();
    indices.sort();
    assert_eq!(indices, vec!["0", "1", "2"]);
    assert!(launcher.peak_concurrency() <= 3);
}

#[tokio::test]
async fn test_explicit_workers_bound_concurrency() {
    let launcher = MockLauncher::new(|_| JobOutcome::pass().with_delay(Duration::from_millis(30)));
    let (summary, _) = run_pipeline_with_mock(SHARDED, &launcher, |c| c.with_workers(1)).await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.workers, 1);
    assert_eq!(launcher.peak_concurrency(), 1);
    assert_eq!(launcher.executed().len(), 3);
}
