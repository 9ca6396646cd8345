//! Agent supervisor - spawns `buildkite-agent start` and manages its lifecycle

use crate::agent::{AgentDiscovery, AgentError, AgentLaunch, AgentLauncher, RunningAgent};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a terminated agent gets to wind down before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Launches the real agent binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    discovery: AgentDiscovery,
}

impl ProcessLauncher {
    pub fn new(discovery: AgentDiscovery) -> Self {
        Self { discovery }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(AgentDiscovery::from_env())
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    fn locate(&self, explicit: Option<&Path>) -> Result<PathBuf, AgentError> {
        self.discovery
            .clone()
            .with_explicit(explicit.map(Path::to_path_buf))
            .locate()
    }

    async fn launch(&self, launch: &AgentLaunch) -> Result<Box<dyn RunningAgent>, AgentError> {
        let agent = AgentProcess::spawn(launch)?;
        Ok(Box::new(agent))
    }
}

/// A running agent child in its own process group
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    drains: Vec<JoinHandle<()>>,
}

impl AgentProcess {
    pub fn spawn(launch: &AgentLaunch) -> Result<Self, AgentError> {
        let mut command = Command::new(&launch.binary);
        command
            .args(launch.args())
            .envs(launch.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole job tree can be signalled at once
        #[cfg(unix)]
        command.process_group(0);

        debug!(binary = %launch.binary.display(), args = ?launch.args(), "spawning agent");
        let mut child = command.spawn().map_err(|source| AgentError::SpawnFailed {
            binary: launch.binary.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, workers = launch.workers, endpoint = %launch.endpoint, "agent started");

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain(stderr, "stderr")));
        }

        Ok(Self { child, pid, drains })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send SIGTERM to the agent's process group
    #[cfg(unix)]
    async fn signal_group(&mut self) -> Result<(), AgentError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let status = Command::new("kill")
            .args(["-TERM", &format!("-{pid}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(status, Ok(s) if s.success()) {
            debug!(pid, "process group not signalled, terminating agent directly");
            let _ = self.child.start_kill();
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn signal_group(&mut self) -> Result<(), AgentError> {
        let _ = self.child.start_kill();
        Ok(())
    }
}

#[async_trait]
impl RunningAgent for AgentProcess {
    async fn terminate(&mut self) -> Result<(), AgentError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        info!(pid = self.pid, "stopping agent");
        self.signal_group().await?;

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(status) => {
                debug!(?status, "agent exited");
            }
            Err(_) => {
                warn!(pid = self.pid, "agent ignored SIGTERM, killing it");
                self.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, AgentError> {
        let status = self.child.wait().await?;
        for drain in self.drains.drain(..) {
            let _ = drain.await;
        }
        Ok(status.code())
    }
}

/// Forward the agent's output into tracing, one event per line
async fn drain<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "agent", stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "agent", stream, error = %e, "agent output closed");
                break;
            }
        }
    }
}
