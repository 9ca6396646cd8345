//! Test utility functions for end-to-end runs

use crate::mock_agent::MockLauncher;
use bk_local::execution::{OutputSink, RunConfig, RunSummary};
use bk_local::{JobState, Orchestrator};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Captures everything the run prints
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        let bytes = self.0.lock().unwrap().clone();
        console::strip_ansi_codes(&String::from_utf8_lossy(&bytes)).to_string()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A pipeline file in a scratch checkout
pub struct Workspace {
    pub dir: TempDir,
    pub pipeline: PathBuf,
    pub output: Captured,
}

impl Workspace {
    pub fn new(yaml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = dir.path().join("pipeline.yml");
        std::fs::write(&pipeline, yaml).unwrap();
        Self {
            dir,
            pipeline,
            output: Captured::default(),
        }
    }

    /// Config that never consults git or the terminal
    pub fn config(&self) -> RunConfig {
        RunConfig::new(&self.pipeline)
            .with_build_dir(self.dir.path().join("builds"))
            .with_checkout_dir(self.dir.path())
            .with_branch("main")
            .with_commit("0123456789abcdef")
            .with_output(OutputSink::new(self.output.clone()))
            .with_stats_interval(Duration::from_millis(50))
            .with_accept_timeout(Duration::from_secs(10))
    }
}

/// Run `yaml` to completion with `launcher`, bounded so a hang fails the test
pub async fn run_pipeline_with_mock(
    yaml: &str,
    launcher: &MockLauncher,
    configure: impl FnOnce(RunConfig) -> RunConfig,
) -> (RunSummary, Workspace) {
    let workspace = Workspace::new(yaml);
    let config = configure(workspace.config());
    let orchestrator = Orchestrator::new(Arc::new(launcher.clone()));

    let summary = tokio::time::timeout(Duration::from_secs(30), orchestrator.run(config))
        .await
        .expect("run timed out")
        .expect("run failed");
    assert_all_terminal(&summary);
    (summary, workspace)
}

/// Assert no job was left pending, waiting or running
pub fn assert_all_terminal(summary: &RunSummary) {
    let open: Vec<_> = summary
        .jobs
        .iter()
        .filter(|j| !j.state.is_terminal())
        .map(|j| (j.name.as_str(), j.state))
        .collect();
    assert!(open.is_empty(), "jobs left unfinished: {open:?}");
}

/// Assert every dependency ended before its dependent started
pub fn assert_dependencies_ended_first(summary: &RunSummary) {
    for (dependent, dependency) in &summary.edges {
        let job = summary.job_by_id(dependent).expect("edge to a known job");
        let dep = summary.job_by_id(dependency).expect("edge to a known job");
        if let (Some(ended), Some(started)) = (dep.ended_at, job.started_at) {
            assert!(
                ended <= started,
                "{:?} started at {started} before {:?} ended at {ended}",
                job.name,
                dep.name
            );
        }
    }
}

/// Assert every job with `label` ended in `state`
pub fn assert_job_state(summary: &RunSummary, label: &str, state: JobState) {
    let jobs = summary.jobs_named(label);
    assert!(!jobs.is_empty(), "no job labelled {label:?}");
    for job in jobs {
        assert_eq!(job.state, state, "job {label:?}");
    }
}

/// Assert `before` finished ahead of `after` on the agent
pub fn assert_finished_before(launcher: &MockLauncher, before: &str, after: &str) {
    let labels = launcher.executed_labels();
    let position = |label: &str| {
        labels
            .iter()
            .position(|l| l == label)
            .unwrap_or_else(|| panic!("{label:?} never ran; ran {labels:?}"))
    };
    assert!(
        position(before) < position(after),
        "{before:?} should finish before {after:?}; order was {labels:?}"
    );
}
