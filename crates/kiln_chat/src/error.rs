//! Error types for generation sessions.

use std::fmt;

/// Generation errors
#[derive(Debug)]
pub enum ChatError {
    /// No LLM credentials or relay configured
    LlmNotConfigured,
    /// LLM request failed before streaming started
    LlmError(String),
    /// The response stream broke after it started
    StreamError(String),
    /// No data arrived before the first-chunk deadline
    FirstChunkTimeout(u64),
    /// Nothing persisted to resume from
    NothingToResume,
    /// Operation not valid in the current session state
    InvalidState {
        operation: String,
        reason: String,
    },
    /// File system error
    IoError(std::io::Error),
    /// Serialization error
    SerializationError(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LlmNotConfigured => write!(
                f,
                "LLM not configured. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or KILN_RELAY_URL"
            ),
            Self::LlmError(msg) => write!(f, "LLM error: {}", msg),
            Self::StreamError(msg) => write!(f, "Stream error: {}", msg),
            Self::FirstChunkTimeout(secs) => {
                write!(f, "No response received within {} seconds", secs)
            }
            Self::NothingToResume => write!(f, "No saved session or pending request to resume"),
            Self::InvalidState { operation, reason } => {
                write!(f, "Cannot {}: {}", operation, reason)
            }
            Self::IoError(e) => write!(f, "I/O error: {}", e),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for generation operations
pub type ChatResult<T> = Result<T, ChatError>;
