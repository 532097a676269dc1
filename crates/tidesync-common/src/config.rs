//! Task configuration snapshot
//!
//! The manager sends the full snapshot with every lifecycle command so a node
//! can (re)build the task's pipeline without a round trip.

use crate::error::{CommonError, Result};
use crate::task::{NodeId, SwimlaneId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Snapshot of a synchronization task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier
    pub task_id: TaskId,

    /// Source side of the task
    pub source: SourceSpec,

    /// Target side of the task
    pub target: TargetSpec,

    /// Source table → target table mappings
    #[serde(default)]
    pub mappings: Vec<TableMapping>,

    /// What to do with events from tables without a mapping
    #[serde(default)]
    pub unmapped_tables: UnmappedTablePolicy,

    /// Nodes allowed to host this task (empty = any node)
    #[serde(default)]
    pub nodes: Vec<NodeId>,

    /// Receivers of idle notices and alarms
    #[serde(default)]
    pub alert_receivers: Vec<String>,

    /// Per-task pipeline overrides (node defaults apply when absent)
    #[serde(default)]
    pub pipeline: Option<PipelineSettings>,
}

impl TaskConfig {
    /// Check whether a node may host this task
    pub fn is_assigned_to(&self, node: &NodeId) -> bool {
        self.nodes.is_empty() || self.nodes.contains(node)
    }

    /// Find the target table for a source table
    pub fn target_table(&self, source_table: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.source_table == source_table)
            .map(|m| m.target_table.as_str())
    }

    /// Validate the snapshot
    pub fn validate(&self) -> Result<()> {
        if self.task_id.as_str().trim().is_empty() {
            return Err(CommonError::config("task_id must not be empty"));
        }
        if self.source.connector.trim().is_empty() {
            return Err(CommonError::config(format!(
                "task '{}': source connector must not be empty",
                self.task_id
            )));
        }
        if self.target.connector.trim().is_empty() {
            return Err(CommonError::config(format!(
                "task '{}': target connector must not be empty",
                self.task_id
            )));
        }
        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if !seen.insert(mapping.source_table.as_str()) {
                return Err(CommonError::config(format!(
                    "task '{}': duplicate mapping for source table '{}'",
                    self.task_id, mapping.source_table
                )));
            }
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .validate()
                .map_err(|e| CommonError::config(format!("task '{}': {}", self.task_id, e)))?;
        }
        Ok(())
    }
}

/// Source connector description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Connector type (e.g. "datagen")
    pub connector: String,

    /// Swimlane this consumer feeds
    #[serde(default = "default_swimlane")]
    pub swimlane: SwimlaneId,

    /// Minimum seconds between two idle notices
    #[serde(default = "default_notice_span")]
    pub empty_fetch_notice_span: i64,

    /// Seconds without data before idle notices are considered (-1 disables)
    #[serde(default = "default_threshold")]
    pub empty_fetch_threshold: i64,

    /// Connector-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_swimlane() -> SwimlaneId {
    SwimlaneId::new("0")
}

fn default_notice_span() -> i64 {
    1800
}

fn default_threshold() -> i64 {
    -1
}

impl SourceSpec {
    pub fn new(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            swimlane: default_swimlane(),
            empty_fetch_notice_span: default_notice_span(),
            empty_fetch_threshold: default_threshold(),
            config: serde_json::Value::Null,
        }
    }
}

/// Target connector description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Connector type (e.g. "stdout")
    pub connector: String,

    /// Connector-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl TargetSpec {
    pub fn new(connector: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            config: serde_json::Value::Null,
        }
    }
}

/// Mapping from a source table to a target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table: String,
    pub target_table: String,
}

impl TableMapping {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
        }
    }
}

/// Handling of events whose table has no mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedTablePolicy {
    /// Forward under the source table name
    #[default]
    PassThrough,
    /// Drop the event
    Skip,
    /// Treat as a fatal condition and stop the task
    Fail,
}

/// How a relay serves batches of different swimlanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwimlanePolicy {
    /// Global FIFO across swimlanes
    #[default]
    Fifo,
    /// Per-swimlane FIFO queues served in rotation
    RoundRobin,
}

/// Pipeline tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Pending batches the select relay holds before `push` blocks
    #[serde(default = "default_capacity")]
    pub select_capacity: usize,

    /// Pending batches the extract relay holds before `push` blocks
    #[serde(default = "default_capacity")]
    pub extract_capacity: usize,

    /// Expected events per batch (informational)
    #[serde(default = "default_batch_hint")]
    pub fetch_batch_hint: usize,

    /// Pause between idle loop iterations
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Upper bound for draining a relay on stop
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Attempts per batch before a stage escalates to stop-and-alarm
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between retries of a failing batch
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Swimlane fairness policy for both relays
    #[serde(default)]
    pub swimlane_policy: SwimlanePolicy,
}

fn default_capacity() -> usize {
    100
}

fn default_batch_hint() -> usize {
    100
}

fn default_loop_interval_ms() -> u64 {
    50
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            select_capacity: default_capacity(),
            extract_capacity: default_capacity(),
            fetch_batch_hint: default_batch_hint(),
            loop_interval_ms: default_loop_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            swimlane_policy: SwimlanePolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.select_capacity == 0 || self.extract_capacity == 0 {
            return Err(CommonError::config("relay capacity must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(CommonError::config("max_retries must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskConfig {
        TaskConfig {
            task_id: TaskId::new("orders"),
            source: SourceSpec::new("datagen"),
            target: TargetSpec::new("stdout"),
            mappings: vec![TableMapping::new("shop.orders", "dw.orders")],
            unmapped_tables: UnmappedTablePolicy::default(),
            nodes: Vec::new(),
            alert_receivers: Vec::new(),
            pipeline: None,
        }
    }

    #[test]
    fn test_defaults_from_json() {
        let config: TaskConfig = serde_json::from_value(serde_json::json!({
            "task_id": "orders",
            "source": {"connector": "datagen"},
            "target": {"connector": "stdout"}
        }))
        .unwrap();

        assert_eq!(config.source.swimlane, SwimlaneId::new("0"));
        assert_eq!(config.source.empty_fetch_threshold, -1);
        assert_eq!(config.unmapped_tables, UnmappedTablePolicy::PassThrough);
        assert!(config.pipeline.is_none());
    }

    #[test]
    fn test_target_table_lookup() {
        let config = task();
        assert_eq!(config.target_table("shop.orders"), Some("dw.orders"));
        assert_eq!(config.target_table("shop.users"), None);
    }

    #[test]
    fn test_assignment() {
        let mut config = task();
        assert!(config.is_assigned_to(&NodeId::new("any")));

        config.nodes = vec![NodeId::new("node-a")];
        assert!(config.is_assigned_to(&NodeId::new("node-a")));
        assert!(!config.is_assigned_to(&NodeId::new("node-b")));
    }

    #[test]
    fn test_validate_rejects_duplicate_mappings() {
        let mut config = task();
        config
            .mappings
            .push(TableMapping::new("shop.orders", "dw.orders_v2"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = task();
        config.pipeline = Some(PipelineSettings {
            select_capacity: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
        config.pipeline = Some(PipelineSettings::default());
        assert!(config.validate().is_ok());
    }
}
