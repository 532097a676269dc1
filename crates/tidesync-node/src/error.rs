//! Error types for tidesync-node
//!
//! Three layers, from the inside out:
//!
//! - [`ConnectorError`]: raised by source, extractor and target connectors
//! - [`StageError`]: the typed outcome of one stage loop iteration
//! - [`NodeError`]: worker, controller and configuration failures

use crate::stage::StageKind;
use thiserror::Error;
use tidesync_common::{CommonError, TaskId, TaskState};

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Result type alias for a stage loop iteration
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Errors raised by connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to external system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout waiting for the external system
    #[error("timeout: {0}")]
    Timeout(String),

    /// Data could not be converted
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Fatal condition that must stop the whole task
    #[error("stop trigger: {0}")]
    StopTrigger(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConnectorError {
    /// Check if this error must stop the task
    pub fn is_stop_trigger(&self) -> bool {
        matches!(self, Self::StopTrigger(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::StopTrigger(_) | Self::Config(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn stop_trigger(msg: impl Into<String>) -> Self {
        Self::StopTrigger(msg.into())
    }
}

/// Outcome of a failed stage loop iteration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Logged and reported; the loop continues
    #[error("retryable stage error: {0}")]
    Retryable(String),

    /// The task must stop and raise an alarm
    #[error("stop trigger: {0}")]
    StopTrigger(String),

    /// Cancellation observed; the loop unwinds
    #[error("cancelled")]
    Cancelled,
}

impl From<ConnectorError> for StageError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::StopTrigger(reason) => StageError::StopTrigger(reason),
            ConnectorError::Config(msg) => StageError::StopTrigger(format!("configuration error: {}", msg)),
            other => StageError::Retryable(other.to_string()),
        }
    }
}

/// Errors raised by the node runtime
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connector type is not registered
    #[error("Unknown connector '{0}'")]
    UnknownConnector(String),

    /// A stage failed its readiness check
    #[error("Task '{task}' {stage} stage is not ready to start")]
    NotReady { task: TaskId, stage: StageKind },

    /// Resource acquisition failed during start
    #[error("Task '{task}' {stage} stage failed to start: {message}")]
    StartFailed {
        task: TaskId,
        stage: StageKind,
        message: String,
    },

    /// Operation not allowed in the worker's current state
    #[error("Task '{task}' cannot {operation} while {state}")]
    InvalidState {
        task: TaskId,
        operation: &'static str,
        state: TaskState,
    },

    /// Task was deleted; no further transitions are accepted
    #[error("Task '{0}' is deleted")]
    TaskDeleted(TaskId),

    /// Task is not hosted on this node
    #[error("Task '{0}' is not hosted on this node")]
    TaskNotFound(TaskId),

    /// Connector error
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Shared type error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
