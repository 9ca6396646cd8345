//! Agent binary discovery

use crate::agent::AgentError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the agent binary explicitly
pub const AGENT_BINARY_ENV: &str = "BUILDKITE_AGENT_BINARY";

#[cfg(windows)]
pub const AGENT_BINARY_NAME: &str = "buildkite-agent.exe";
#[cfg(not(windows))]
pub const AGENT_BINARY_NAME: &str = "buildkite-agent";

/// Finds the agent binary: explicit path, then `BUILDKITE_AGENT_BINARY`,
/// then the search path, then well-known install locations.
#[derive(Debug, Clone, Default)]
pub struct AgentDiscovery {
    explicit: Option<PathBuf>,
    env_override: Option<PathBuf>,
    search_path: Option<OsString>,
    well_known: Vec<PathBuf>,
}

impl AgentDiscovery {
    /// Discovery against the current process environment
    pub fn from_env() -> Self {
        Self {
            explicit: None,
            env_override: std::env::var_os(AGENT_BINARY_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            search_path: std::env::var_os("PATH"),
            well_known: well_known_paths(),
        }
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    pub fn with_env_override(mut self, path: Option<PathBuf>) -> Self {
        self.env_override = path;
        self
    }

    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    pub fn with_well_known(mut self, paths: Vec<PathBuf>) -> Self {
        self.well_known = paths;
        self
    }

    pub fn locate(&self) -> Result<PathBuf, AgentError> {
        // An explicit path is taken at its word
        if let Some(path) = &self.explicit {
            return if is_executable(path) {
                Ok(path.clone())
            } else {
                Err(AgentError::BinaryMissing {
                    searched: path.display().to_string(),
                })
            };
        }

        if let Some(path) = &self.env_override {
            if is_executable(path) {
                debug!(path = %path.display(), "agent binary from {}", AGENT_BINARY_ENV);
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "{} does not point at a file, searching", AGENT_BINARY_ENV);
        }

        if let Some(search_path) = &self.search_path {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if let Ok(path) = which::which_in(AGENT_BINARY_NAME, Some(search_path), cwd) {
                debug!(path = %path.display(), "agent binary from search path");
                return Ok(path);
            }
        }

        if let Some(path) = self.well_known.iter().find(|p| is_executable(p)) {
            debug!(path = %path.display(), "agent binary from well-known location");
            return Ok(path.clone());
        }

        Err(AgentError::BinaryMissing {
            searched: self.describe_search(),
        })
    }

    fn describe_search(&self) -> String {
        let mut places = Vec::new();
        if let Some(path) = &self.env_override {
            places.push(format!("${AGENT_BINARY_ENV}={}", path.display()));
        }
        if self.search_path.is_some() {
            places.push("$PATH".to_string());
        }
        places.extend(self.well_known.iter().map(|p| p.display().to_string()));
        places.join(", ")
    }
}

fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Install locations used by the agent's packages and installer script
pub fn well_known_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();

    if cfg!(target_os = "macos") {
        paths.push("/opt/homebrew/bin/buildkite-agent".into());
        paths.push("/usr/local/bin/buildkite-agent".into());
    } else if cfg!(windows) {
        paths.push(r"C:\buildkite-agent\bin\buildkite-agent.exe".into());
        paths.push(r"C:\Program Files\Buildkite\buildkite-agent.exe".into());
    } else {
        paths.push("/usr/bin/buildkite-agent".into());
        paths.push("/usr/local/bin/buildkite-agent".into());
        paths.push("/opt/buildkite-agent/bin/buildkite-agent".into());
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".buildkite-agent").join("bin").join(AGENT_BINARY_NAME));
    }
    paths
}
