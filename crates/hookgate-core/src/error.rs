//! Unified error types for Hookgate

use thiserror::Error;

/// Unified error type for all Hookgate operations
#[derive(Error, Debug)]
pub enum HookgateError {
    /// A guard hook refused the underlying action. The message is surfaced
    /// to the operator verbatim.
    #[error("{message}")]
    Blocked { hook: String, message: String },

    // Host errors
    #[error("Host call failed: {0}")]
    Host(String),

    // Sampling errors
    #[error("Process sampling failed: {0}")]
    Sampler(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // Contract errors
    #[error("Unsupported protocol version {found} (expected {expected})")]
    ProtocolVersion { found: u32, expected: u32 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl HookgateError {
    /// Build a policy violation raised by `hook`
    pub fn blocked(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Blocked {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a deliberate policy block
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Result type alias using HookgateError
pub type Result<T> = std::result::Result<T, HookgateError>;
