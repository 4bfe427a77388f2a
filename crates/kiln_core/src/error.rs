//! Error types for the core module.

use kiln_chat::ChatError;
use kiln_sandbox::HostError;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while orchestrating a session.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Sandbox error: {0}")]
    Host(#[from] HostError),

    #[error("Generation error: {0}")]
    Chat(#[from] ChatError),

    #[error("Invalid boot transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Engine stopped")]
    EngineStopped,

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
