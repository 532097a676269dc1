//! Node log delivery
//!
//! Stages report recoverable errors, idle notices and alarms as [`NodeLog`]
//! records. Delivery goes through a [`LogSink`]; a failing sink is logged and
//! otherwise ignored so telemetry can never take a pipeline down.
//!
//! [`Notifier`] is the default sink: it writes each record through `tracing`
//! and fans it out to in-process subscribers (alert mailers, tests).
//!
//! ```rust,ignore
//! let notifier = Notifier::new(64);
//! let mut rx = notifier.subscribe();
//! notifier.upload(NodeLog::alarm(task_id, "binlog purged"))?;
//! let log = rx.recv().await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tidesync_common::{LogType, NodeLog};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Telemetry delivery failure
#[derive(Debug, Error)]
#[error("telemetry delivery failed: {0}")]
pub struct TelemetryError(pub String);

/// Destination for node log records
pub trait LogSink: Send + Sync {
    /// Deliver one record
    fn upload(&self, log: NodeLog) -> Result<(), TelemetryError>;
}

/// Sink that logs through `tracing` and broadcasts to subscribers
pub struct Notifier {
    tx: broadcast::Sender<NodeLog>,
    uploaded: AtomicU64,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            uploaded: AtomicU64::new(0),
        }
    }

    /// Receive every record uploaded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NodeLog> {
        self.tx.subscribe()
    }

    /// Records uploaded since creation
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LogSink for Notifier {
    fn upload(&self, log: NodeLog) -> Result<(), TelemetryError> {
        let swimlane = log
            .swimlane_id
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("-");
        match log.log_type {
            LogType::TaskLog => {
                info!(task = %log.task_id, swimlane, category = log.category(), "{}", log.message)
            }
            LogType::TaskWarning => {
                warn!(task = %log.task_id, swimlane, category = log.category(), "{}", log.message)
            }
            LogType::TaskAlarm => {
                error!(task = %log.task_id, swimlane, category = log.category(), "{}", log.message)
            }
        }

        self.uploaded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tidesync_node_logs_total", "category" => log.category()).increment(1);
        // No subscriber is not a delivery failure
        let _ = self.tx.send(log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_common::{SwimlaneId, TaskId};

    #[tokio::test]
    async fn test_notifier_fans_out() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier
            .upload(NodeLog::task_log(
                TaskId::new("orders"),
                SwimlaneId::new("0"),
                "fetch error",
            ))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "fetch error");
        assert_eq!(notifier.uploaded(), 1);
    }

    #[test]
    fn test_notifier_without_subscribers() {
        let notifier = Notifier::default();
        assert!(notifier
            .upload(NodeLog::alarm(TaskId::new("orders"), "gone"))
            .is_ok());
    }
}
