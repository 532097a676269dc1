//! Cluster command boundary
//!
//! The manager broadcasts a [`TaskPushCommand`] whenever an operator changes a
//! task's status. Delivery is at-least-once: the node hosting the task applies
//! it idempotently and every other node ignores it.
//!
//! ```text
//! operator ──▶ manager (commit state) ──▶ ClusterCommandChannel ──▶ nodes
//!                    │
//!                    └──▶ StateChangeAck { committed, propagation }
//! ```
//!
//! The real transport is pluggable; [`InProcessChannel`] wires a manager and
//! nodes living in one process.

use crate::config::TaskConfig;
use crate::error::{CommonError, Result};
use crate::task::{TaskId, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Task status change pushed from the manager to the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPushCommand {
    /// Task the command targets
    pub task_id: TaskId,
    /// Requested state
    pub new_state: TaskState,
    /// Task configuration at the time of the change
    pub snapshot: TaskConfig,
    /// When the manager issued the command
    pub issued_at: DateTime<Utc>,
}

impl TaskPushCommand {
    pub fn new(new_state: TaskState, snapshot: TaskConfig) -> Self {
        Self {
            task_id: snapshot.task_id.clone(),
            new_state,
            snapshot,
            issued_at: Utc::now(),
        }
    }
}

/// Receiving side of a cluster command channel
pub struct CommandSubscription {
    inner: broadcast::Receiver<TaskPushCommand>,
}

impl CommandSubscription {
    pub fn new(inner: broadcast::Receiver<TaskPushCommand>) -> Self {
        Self { inner }
    }

    /// Wait for the next command; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<TaskPushCommand> {
        loop {
            match self.inner.recv().await {
                Ok(command) => return Some(command),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Command subscription lagged, commands were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Transport delivering task status changes to cluster nodes
#[async_trait]
pub trait ClusterCommandChannel: Send + Sync {
    /// Deliver a command to every subscribed node
    async fn broadcast(&self, command: TaskPushCommand) -> Result<()>;

    /// Subscribe to commands
    fn subscribe(&self) -> CommandSubscription;
}

/// Single-process command channel on top of `tokio::sync::broadcast`
#[derive(Clone)]
pub struct InProcessChannel {
    tx: broadcast::Sender<TaskPushCommand>,
}

impl InProcessChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of nodes currently subscribed
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ClusterCommandChannel for InProcessChannel {
    async fn broadcast(&self, command: TaskPushCommand) -> Result<()> {
        self.tx
            .send(command)
            .map(|_| ())
            .map_err(|e| CommonError::channel(format!("no node subscribed for task {}", e.0.task_id)))
    }

    fn subscribe(&self) -> CommandSubscription {
        CommandSubscription::new(self.tx.subscribe())
    }
}

/// Outcome of pushing a committed state change to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Propagation {
    /// Command handed to the transport
    Delivered,
    /// State is manager-side only and is not broadcast
    NotPropagated,
    /// Transport failed; the committed state stands
    Failed(String),
}

/// Acknowledgement returned to the operator after a state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeAck {
    pub task_id: TaskId,
    /// State committed by the manager
    pub committed: TaskState,
    /// Cluster propagation result
    pub propagation: Propagation,
}

impl StateChangeAck {
    /// True when the command was accepted but a node-reachability problem exists
    pub fn is_soft_failure(&self) -> bool {
        matches!(self.propagation, Propagation::Failed(_))
    }
}

/// Broadcast a committed state change without rolling it back on failure
pub async fn publish_state_change(
    channel: &dyn ClusterCommandChannel,
    committed: TaskState,
    snapshot: TaskConfig,
) -> StateChangeAck {
    let task_id = snapshot.task_id.clone();

    if !committed.is_broadcast() {
        return StateChangeAck {
            task_id,
            committed,
            propagation: Propagation::NotPropagated,
        };
    }

    let propagation = match channel
        .broadcast(TaskPushCommand::new(committed, snapshot))
        .await
    {
        Ok(()) => {
            info!(task = %task_id, state = %committed, "Task state change broadcast");
            Propagation::Delivered
        }
        Err(e) => {
            error!(task = %task_id, state = %committed, error = %e, "Task state change broadcast failed");
            Propagation::Failed(e.to_string())
        }
    };

    StateChangeAck {
        task_id,
        committed,
        propagation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceSpec, TargetSpec};

    fn snapshot(id: &str) -> TaskConfig {
        TaskConfig {
            task_id: TaskId::new(id),
            source: SourceSpec::new("datagen"),
            target: TargetSpec::new("stdout"),
            mappings: Vec::new(),
            unmapped_tables: Default::default(),
            nodes: Vec::new(),
            alert_receivers: Vec::new(),
            pipeline: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let channel = InProcessChannel::default();
        let mut sub = channel.subscribe();

        let ack = publish_state_change(&channel, TaskState::Working, snapshot("orders")).await;
        assert_eq!(ack.propagation, Propagation::Delivered);

        let command = sub.recv().await.unwrap();
        assert_eq!(command.task_id, TaskId::new("orders"));
        assert_eq!(command.new_state, TaskState::Working);
    }

    #[tokio::test]
    async fn test_new_state_is_not_broadcast() {
        let channel = InProcessChannel::default();
        let ack = publish_state_change(&channel, TaskState::New, snapshot("orders")).await;
        assert_eq!(ack.propagation, Propagation::NotPropagated);
        assert_eq!(ack.committed, TaskState::New);
    }

    #[tokio::test]
    async fn test_failed_broadcast_is_soft_failure() {
        let channel = InProcessChannel::default();
        assert_eq!(channel.subscriber_count(), 0);

        let ack = publish_state_change(&channel, TaskState::Stopped, snapshot("orders")).await;
        assert!(ack.is_soft_failure());
        assert_eq!(ack.committed, TaskState::Stopped);
    }
}
