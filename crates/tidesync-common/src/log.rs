//! Node log records
//!
//! Nodes upload structured records for task errors, idle notices and alarms.
//! A record is keyed by task and swimlane and carries enough context for an
//! operator to act on it without reading node logs.

use crate::task::{NodeId, SwimlaneId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of node log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    /// Recoverable task error
    TaskLog,
    /// Idle notice (no data consumed for a while)
    TaskWarning,
    /// Task stopped on a stop trigger
    TaskAlarm,
}

impl LogType {
    /// Records that should reach the alert receivers
    pub fn is_alert(&self) -> bool {
        matches!(self, LogType::TaskWarning | LogType::TaskAlarm)
    }
}

/// Structured log/alert record uploaded by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLog {
    /// Unique record id
    pub id: Uuid,
    /// Record kind
    pub log_type: LogType,
    /// Task the record belongs to
    pub task_id: TaskId,
    /// Swimlane the record belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swimlane_id: Option<SwimlaneId>,
    /// Node that produced the record (filled in on upload)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Short title for alert channels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Message body
    pub message: String,
    /// Minutes without consumed data (idle notices only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<i64>,
    /// Alert receivers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<String>,
    /// Creation time
    pub time: DateTime<Utc>,
}

impl NodeLog {
    /// Create a record
    pub fn new(log_type: LogType, task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_type,
            task_id,
            swimlane_id: None,
            node_id: None,
            title: None,
            message: message.into(),
            idle_minutes: None,
            receivers: Vec::new(),
            time: Utc::now(),
        }
    }

    /// Recoverable task error
    pub fn task_log(task_id: TaskId, swimlane_id: SwimlaneId, message: impl Into<String>) -> Self {
        Self::new(LogType::TaskLog, task_id, message).with_swimlane(swimlane_id)
    }

    /// Alarm raised when a task is stopped by a stop trigger
    pub fn alarm(task_id: TaskId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let title = format!("[ALARM] {} stopped: {}", task_id, reason);
        Self::new(LogType::TaskAlarm, task_id, reason).with_title(title)
    }

    pub fn with_swimlane(mut self, swimlane_id: SwimlaneId) -> Self {
        self.swimlane_id = Some(swimlane_id);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_idle_minutes(mut self, minutes: i64) -> Self {
        self.idle_minutes = Some(minutes);
        self
    }

    pub fn with_receivers(mut self, receivers: Vec<String>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Statistic category used by log collectors
    pub fn category(&self) -> &'static str {
        match self.log_type {
            LogType::TaskLog => "task_log",
            LogType::TaskWarning => "task_warning",
            LogType::TaskAlarm => "task_alarm",
        }
    }

    /// JSON rendering
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// One `key: value` line per field, for mail and console channels
    pub fn to_println(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let mut out = String::new();
        if let serde_json::Value::Object(fields) = value {
            for (key, value) in fields {
                let rendered = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                out.push_str(&key);
                out.push_str(":      ");
                out.push_str(&rendered);
                out.push('\n');
            }
        }
        out
    }
}

impl std::fmt::Display for NodeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_record() {
        let log = NodeLog::alarm(TaskId::new("orders"), "binlog purged");
        assert_eq!(log.log_type, LogType::TaskAlarm);
        assert!(log.log_type.is_alert());
        assert_eq!(log.category(), "task_alarm");
        assert!(log.title.as_deref().unwrap().contains("binlog purged"));
    }

    #[test]
    fn test_to_println_lists_fields() {
        let log = NodeLog::task_log(
            TaskId::new("orders"),
            SwimlaneId::new("3"),
            "fetch error",
        );
        let text = log.to_println();
        assert!(text.contains("task_id:      orders"));
        assert!(text.contains("swimlane_id:      3"));
        assert!(text.contains("message:      fetch error"));
        assert!(!text.contains("idle_minutes"));
    }

    #[test]
    fn test_json_round_trip_keeps_type() {
        let log = NodeLog::new(LogType::TaskWarning, TaskId::new("t"), "idle")
            .with_idle_minutes(12)
            .with_receivers(vec!["ops@example.com".to_string()]);
        let parsed: NodeLog = serde_json::from_str(&log.to_json()).unwrap();
        assert_eq!(parsed, log);
    }
}
