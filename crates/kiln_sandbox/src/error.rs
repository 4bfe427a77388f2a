//! Error types for sandbox hosts.

use thiserror::Error;

/// Result type alias for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while driving a sandbox host.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Sandbox host unavailable: {0}")]
    Unavailable(String),

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Failed to spawn {command}: {message}")]
    SpawnFailed { command: String, message: String },

    #[error("Path escapes the sandbox root: {0}")]
    InvalidPath(String),

    #[error("Process {0} ended without reporting an exit code")]
    ProcessLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Whether the host itself is gone, as opposed to a single failed call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
