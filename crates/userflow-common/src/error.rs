//! Error types for userflow

use thiserror::Error;

/// Result type alias for userflow operations
pub type Result<T> = std::result::Result<T, UserflowError>;

/// Failures shared by every stage
#[derive(Error, Debug)]
pub enum UserflowError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event bus error: {0}")]
    Bus(String),
}

impl UserflowError {
    /// Create an event bus error
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }
}
