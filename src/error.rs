//! Pipeline Error Types
//!
//! Error taxonomy shared by the router, formatter and supervisor.
//! Only spawn failures are surfaced to the user; the rest are logged and recovered.

use thiserror::Error;

/// Pipeline-level errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Executable missing, unreadable or not executable
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// Subprocess ignored the interrupt for the whole grace period
    #[error("Session {session_id} did not exit within {grace_ms}ms of interrupt")]
    InterruptTimeout { session_id: String, grace_ms: u64 },

    /// Unexpected byte sequence in agent output
    #[error("Formatter fault: {0}")]
    FormatterFault(String),

    /// Output arrived for a session that is not registered
    #[error("No route for session: {0}")]
    RouterMiss(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for PipelineError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        PipelineError::FormatterFault(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
