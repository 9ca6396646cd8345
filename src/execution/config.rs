//! Run configuration

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on agent workers
pub const MAX_WORKERS: usize = 10;

/// Branch reported to jobs when git cannot tell
pub const FALLBACK_BRANCH: &str = "main";

/// Commit reported to jobs when git cannot tell
pub const FALLBACK_COMMIT: &str = "HEAD";

/// Where run output (plan listings, event lines, the summary) goes
#[derive(Clone)]
pub struct OutputSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Write one line; output errors are not worth failing a run over
    pub fn line(&self, line: impl AsRef<str>) {
        if let Ok(mut out) = self.0.lock() {
            let _ = writeln!(out, "{}", line.as_ref());
            let _ = out.flush();
        }
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutputSink")
    }
}

/// Configuration for a local run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Pipeline file to load
    pub pipeline_path: PathBuf,

    /// Agent workers; 0 picks the plan's widest layer
    pub workers: usize,

    /// Environment overlay, lowest precedence in every job
    pub env: BTreeMap<String, String>,

    /// Loopback port for the protocol server; 0 lets the OS choose
    pub port: u16,

    /// Print the plan and exit
    pub dry_run: bool,

    /// Explicit agent binary, skipping discovery
    pub agent_binary: Option<PathBuf>,

    /// Agent build directory; a temporary one is created when absent
    pub build_dir: Option<PathBuf>,

    pub output: OutputSink,

    /// Defaults to the checkout's current branch
    pub branch: Option<String>,

    /// Defaults to the checkout's HEAD commit
    pub commit: Option<String>,

    /// Source checkout jobs run against; defaults to the working directory
    pub checkout_dir: Option<PathBuf>,

    /// How long a handed-out job may go unaccepted before it is failed
    pub accept_timeout: Duration,

    /// Progress sampling period
    pub stats_interval: Duration,

    /// Draw a progress bar
    pub progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pipeline_path: PathBuf::from(".buildkite/pipeline.yml"),
            workers: 0,
            env: BTreeMap::new(),
            port: 0,
            dry_run: false,
            agent_binary: None,
            build_dir: None,
            output: OutputSink::default(),
            branch: None,
            commit: None,
            checkout_dir: None,
            accept_timeout: Duration::from_secs(120),
            stats_interval: Duration::from_secs(2),
            progress: false,
        }
    }
}

impl RunConfig {
    pub fn new(pipeline_path: impl Into<PathBuf>) -> Self {
        Self {
            pipeline_path: pipeline_path.into(),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_agent_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_binary = Some(path.into());
        self
    }

    pub fn with_build_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(path.into());
        self
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_checkout_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkout_dir = Some(path.into());
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Worker count: the explicit setting if positive, else `suggested`,
    /// clamped to `1..=MAX_WORKERS`
    pub fn resolve_workers(&self, suggested: usize) -> usize {
        let wanted = if self.workers > 0 { self.workers } else { suggested };
        wanted.clamp(1, MAX_WORKERS)
    }

    pub fn checkout_dir(&self) -> PathBuf {
        self.checkout_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Configured branch, else the checkout's branch, else `main`
    pub async fn resolve_branch(&self) -> String {
        match &self.branch {
            Some(branch) => branch.clone(),
            None => git_output(&self.checkout_dir(), &["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .filter(|b| b != "HEAD")
                .unwrap_or_else(|| FALLBACK_BRANCH.to_string()),
        }
    }

    /// Configured commit, else the checkout's HEAD sha, else `HEAD`
    pub async fn resolve_commit(&self) -> String {
        match &self.commit {
            Some(commit) => commit.clone(),
            None => git_output(&self.checkout_dir(), &["rev-parse", "HEAD"])
                .await
                .unwrap_or_else(|| FALLBACK_COMMIT.to_string()),
        }
    }
}

async fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
