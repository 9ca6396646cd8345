//! CLI command definitions

use crate::execution::RunConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Where pipelines live by convention
pub const DEFAULT_PIPELINE: &str = ".buildkite/pipeline.yml";

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(default_value = DEFAULT_PIPELINE)]
    pub pipeline: PathBuf,

    /// Agent workers (0 = as many as the pipeline can use, up to 10)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Environment overrides (KEY=VALUE), lowest precedence in every job
    #[arg(short, long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Port for the local agent API (0 = any free port)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Print the planned jobs and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Path to the buildkite-agent binary
    #[arg(long)]
    pub agent_binary: Option<PathBuf>,

    /// Agent build directory (default: a temporary directory)
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Branch reported to jobs (default: current git branch)
    #[arg(long)]
    pub branch: Option<String>,

    /// Commit reported to jobs (default: git HEAD)
    #[arg(long)]
    pub commit: Option<String>,

    /// Source checkout jobs run in (default: current directory)
    #[arg(long)]
    pub checkout_dir: Option<PathBuf>,

    /// Seconds a handed-out job may go unaccepted before it fails
    #[arg(long, default_value_t = 120)]
    pub accept_timeout: u64,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl RunCommand {
    pub fn to_config(&self) -> RunConfig {
        let mut config = RunConfig::new(&self.pipeline)
            .with_workers(self.workers)
            .with_port(self.port)
            .with_dry_run(self.dry_run)
            .with_accept_timeout(Duration::from_secs(self.accept_timeout))
            .with_progress(!self.no_progress && console::Term::stdout().is_term());

        for (key, value) in &self.env {
            config = config.with_env(key, value);
        }
        if let Some(path) = &self.agent_binary {
            config = config.with_agent_binary(path);
        }
        if let Some(path) = &self.build_dir {
            config = config.with_build_dir(path);
        }
        if let Some(branch) = &self.branch {
            config = config.with_branch(branch);
        }
        if let Some(commit) = &self.commit {
            config = config.with_commit(commit);
        }
        if let Some(path) = &self.checkout_dir {
            config = config.with_checkout_dir(path);
        }
        config
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(default_value = DEFAULT_PIPELINE)]
    pub pipeline: PathBuf,

    /// Output the planned jobs as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
