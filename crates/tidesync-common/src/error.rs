//! Error types shared by manager and node

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared types
#[derive(Error, Debug)]
pub enum CommonError {
    /// Invalid task configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster command channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Unknown task state name
    #[error("Unknown task state: {0}")]
    UnknownState(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommonError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}
