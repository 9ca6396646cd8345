//! Agent supervisor errors

use std::path::PathBuf;
use thiserror::Error;

/// Error types for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("buildkite-agent binary not found (looked in: {searched})")]
    BinaryMissing { searched: String },

    #[error("failed to spawn {}: {source}", binary.display())]
    SpawnFailed {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}
