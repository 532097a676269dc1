//! Task identity and lifecycle state

use crate::error::CommonError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Swimlane (partition) identifier inside a task's event stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwimlaneId(pub String);

impl SwimlaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SwimlaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SwimlaneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("node-{}", uuid::Uuid::new_v4()))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a synchronization task
///
/// `New` is the manager-side creation state. `Working` and `Stopped` are the
/// operational states a node observes. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Working,
    Stopped,
    Deleted,
}

impl TaskState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Deleted)
    }

    /// States the manager broadcasts to the cluster
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            TaskState::Working | TaskState::Stopped | TaskState::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "NEW",
            TaskState::Working => "WORKING",
            TaskState::Stopped => "STOPPED",
            TaskState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(TaskState::New),
            "WORKING" => Ok(TaskState::Working),
            "STOPPED" => Ok(TaskState::Stopped),
            "DELETED" => Ok(TaskState::Deleted),
            other => Err(CommonError::UnknownState(other.to_string())),
        }
    }
}
