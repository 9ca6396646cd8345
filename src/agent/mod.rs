//! Agent supervisor: finds the `buildkite-agent` binary and runs it against
//! the local protocol server

pub mod discovery;
pub mod error;
pub mod supervisor;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use discovery::{AgentDiscovery, AGENT_BINARY_ENV, AGENT_BINARY_NAME};
pub use error::AgentError;
pub use supervisor::{AgentProcess, ProcessLauncher};

/// Everything needed to start an agent
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub binary: PathBuf,
    /// Loopback endpoint of the protocol server
    pub endpoint: String,
    pub token: String,
    /// Jobs the agent runs at once (`--spawn`)
    pub workers: usize,
    pub build_dir: PathBuf,
    pub name: String,
    /// Extra environment for the agent process
    pub env: BTreeMap<String, String>,
}

impl AgentLaunch {
    /// `buildkite-agent start` arguments, with the features that need a real
    /// backend switched off
    pub fn args(&self) -> Vec<String> {
        vec![
            "start".to_string(),
            "--spawn".to_string(),
            self.workers.to_string(),
            "--endpoint".to_string(),
            self.endpoint.clone(),
            "--token".to_string(),
            self.token.clone(),
            "--build-path".to_string(),
            self.build_dir.display().to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--no-ssh-keyscan".to_string(),
            "--git-mirrors-skip-update".to_string(),
            "--no-http2".to_string(),
        ]
    }

    /// Environment for the agent; endpoint and token are duplicated here so the
    /// agent finds them either way
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.push(("BUILDKITE_AGENT_ENDPOINT".to_string(), self.endpoint.clone()));
        vars.push(("BUILDKITE_AGENT_TOKEN".to_string(), self.token.clone()));
        vars.push((
            "BUILDKITE_BUILD_PATH".to_string(),
            self.build_dir.display().to_string(),
        ));
        vars
    }
}

/// Starts agents. The process launcher is the real thing; tests substitute an
/// in-process agent that speaks the protocol directly.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Resolve the agent binary, honoring an explicit path
    fn locate(&self, explicit: Option<&Path>) -> Result<PathBuf, AgentError>;

    async fn launch(&self, launch: &AgentLaunch) -> Result<Box<dyn RunningAgent>, AgentError>;
}

/// A started agent
#[async_trait]
pub trait RunningAgent: Send {
    /// Ask the agent to stop
    async fn terminate(&mut self) -> Result<(), AgentError>;

    /// Wait for the agent to exit, returning its exit code if it had one
    async fn wait(&mut self) -> Result<Option<i32>, AgentError>;
}
