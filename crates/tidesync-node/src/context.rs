//! Process-wide node context
//!
//! Created once at node startup and passed explicitly to every task worker.
//! It holds the node identity, the pipeline defaults, the idle registry read
//! by health checks and the telemetry sink. [`NodeContext::teardown`] is called on node shutdown
//! after every task has stopped.

use crate::idle::IdleRegistry;
use crate::telemetry::{LogSink, Notifier};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidesync_common::{NodeId, NodeLog, PipelineSettings, SwimlaneId, TaskConfig, TaskId};
use tracing::{info, warn};

/// Shared node state
pub struct NodeContext {
    node_id: NodeId,
    defaults: PipelineSettings,
    idle: IdleRegistry,
    sink: Arc<dyn LogSink>,
    started_at: Instant,
    closed: AtomicBool,
    generations: AtomicU64,
}

impl NodeContext {
    /// Create a context with a custom telemetry sink
    pub fn new(node_id: NodeId, sink: Arc<dyn LogSink>) -> Arc<Self> {
        Self::with_defaults(node_id, sink, PipelineSettings::default())
    }

    /// Create a context whose tasks fall back to `defaults`
    pub fn with_defaults(
        node_id: NodeId,
        sink: Arc<dyn LogSink>,
        defaults: PipelineSettings,
    ) -> Arc<Self> {
        info!(node = %node_id, "Node context initialized");
        Arc::new(Self {
            node_id,
            defaults,
            idle: IdleRegistry::new(),
            sink,
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
            generations: AtomicU64::new(0),
        })
    }

    /// Create a context with the default [`Notifier`] sink
    pub fn with_notifier(node_id: NodeId) -> (Arc<Self>, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::default());
        let ctx = Self::new(node_id, notifier.clone());
        (ctx, notifier)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Fresh generation number for a newly built task worker
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Effective pipeline settings of a task
    pub fn pipeline_for(&self, task: &TaskConfig) -> PipelineSettings {
        task.pipeline.clone().unwrap_or_else(|| self.defaults.clone())
    }

    pub fn idle(&self) -> &IdleRegistry {
        &self.idle
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Upload a node log record; failures are logged and swallowed
    pub fn report(&self, log: NodeLog) {
        let log = log.with_node(self.node_id.clone());
        let task = log.task_id.clone();
        let category = log.category();
        if let Err(e) = self.sink.upload(log) {
            warn!(task = %task, category, error = %e, "Failed to upload node log");
        }
    }

    /// Publish how long a consumer has gone without data
    pub fn flush_consumer_idle(&self, task_id: &TaskId, swimlane_id: &SwimlaneId, idle_secs: i64) {
        self.idle.flush(task_id, swimlane_id, idle_secs);
        metrics::gauge!(
            "tidesync_consumer_idle_seconds",
            "task" => task_id.to_string(),
            "swimlane" => swimlane_id.to_string()
        )
        .set(idle_secs.max(0) as f64);
    }

    /// Release node-wide state on shutdown
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.idle.clear();
        info!(node = %self.node_id, uptime_secs = self.uptime_secs(), "Node context closed");
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("idle_entries", &self.idle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryError;

    struct BrokenSink;

    impl LogSink for BrokenSink {
        fn upload(&self, _log: NodeLog) -> Result<(), TelemetryError> {
            Err(TelemetryError("collector unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_report_stamps_node_id() {
        let (ctx, notifier) = NodeContext::with_notifier(NodeId::new("node-a"));
        let mut rx = notifier.subscribe();

        ctx.report(NodeLog::alarm(TaskId::new("orders"), "gone"));

        let log = rx.recv().await.unwrap();
        assert_eq!(log.node_id, Some(NodeId::new("node-a")));
    }

    #[test]
    fn test_report_swallows_sink_failure() {
        let ctx = NodeContext::new(NodeId::new("node-a"), Arc::new(BrokenSink));
        ctx.report(NodeLog::alarm(TaskId::new("orders"), "gone"));
    }

    #[test]
    fn test_teardown_clears_idle_registry() {
        let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
        ctx.flush_consumer_idle(&TaskId::new("orders"), &SwimlaneId::new("0"), 12);
        assert_eq!(ctx.idle().len(), 1);

        ctx.teardown();
        assert!(ctx.is_closed());
        assert!(ctx.idle().is_empty());
        ctx.teardown();
    }
}
