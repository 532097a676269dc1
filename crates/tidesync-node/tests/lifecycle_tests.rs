//! Lifecycle controller integration tests: cluster commands, alarms, health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_common::{
    publish_state_change, ClusterCommandChannel, InProcessChannel, LogType, NodeId, NodeLog,
    PipelineSettings, Propagation, TaskConfig, TaskId, TaskPushCommand, TaskState,
};
use tidesync_node::connectors::MemoryStore;
use tidesync_node::health::is_healthy;
use tidesync_node::telemetry::{LogSink, TelemetryError};
use tidesync_node::testing::{registry_with, sample_batch, task_config, ScriptStep, ScriptedSource};
use tidesync_node::{
    ApplyOutcome, ConnectorRegistry, ConnectorResult, LifecycleController, NodeContext,
    SourceConnector,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        loop_interval_ms: 5,
        drain_timeout_ms: 300,
        retry_backoff_ms: 10,
        ..Default::default()
    }
}

/// Datagen task producing 20 events, then going quiet
fn datagen_task(id: &str) -> TaskConfig {
    let mut task = task_config(id, "datagen", "memory");
    task.source.config = serde_json::json!({
        "table": "shop.orders",
        "events_per_second": 0,
        "batch_size": 5,
        "max_events": 20,
    });
    task.pipeline = Some(fast_settings());
    task
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_alarm(rx: &mut broadcast::Receiver<NodeLog>) -> NodeLog {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(log) if log.log_type == LogType::TaskAlarm => return log,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notifier closed"),
            }
        }
    })
    .await
    .expect("no alarm uploaded")
}

#[tokio::test]
async fn test_commands_drive_task_lifecycle() {
    let store = MemoryStore::new();
    let registry = ConnectorRegistry::with_builtins().with_memory_store(store.clone());
    let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
    let (controller, _alarms) = LifecycleController::new(ctx, registry);

    let channel = InProcessChannel::default();
    let commands = channel.subscribe();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        async move { controller.serve(commands, shutdown).await }
    });
    let task_id = TaskId::new("orders");

    let ack = publish_state_change(&channel, TaskState::Working, datagen_task("orders")).await;
    assert_eq!(ack.propagation, Propagation::Delivered);
    wait_for(|| controller.state_of(&task_id) == Some(TaskState::Working)).await;
    wait_for(|| store.event_count() == 20).await;

    publish_state_change(&channel, TaskState::Stopped, datagen_task("orders")).await;
    wait_for(|| controller.state_of(&task_id) == Some(TaskState::Stopped)).await;
    assert!(controller.last_report(&task_id).await.unwrap().is_clean());

    // A stopped task restarts from a fresh snapshot
    publish_state_change(&channel, TaskState::Working, datagen_task("orders")).await;
    wait_for(|| store.event_count() == 40).await;
    assert_eq!(controller.state_of(&task_id), Some(TaskState::Working));

    publish_state_change(&channel, TaskState::Deleted, datagen_task("orders")).await;
    wait_for(|| controller.state_of(&task_id) == Some(TaskState::Deleted)).await;

    shutdown.cancel();
    server.await.unwrap();

    let outcome = controller.start_local(datagen_task("orders")).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
    assert_eq!(controller.state_of(&task_id), Some(TaskState::Deleted));
    assert_eq!(store.event_count(), 40);
}

#[tokio::test]
async fn test_commands_for_other_nodes_are_ignored() {
    let registry = ConnectorRegistry::with_builtins().with_memory_store(MemoryStore::new());
    let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
    let (controller, _alarms) = LifecycleController::new(ctx, registry);

    let mut task = datagen_task("elsewhere");
    task.nodes = vec![NodeId::new("node-b")];
    let outcome = controller
        .apply(TaskPushCommand::new(TaskState::Working, task.clone()))
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Ignored);
    assert!(!controller.is_hosted(&task.task_id));
}

#[tokio::test]
async fn test_reassigned_task_is_stopped_locally() {
    let store = MemoryStore::new();
    let registry = ConnectorRegistry::with_builtins().with_memory_store(store.clone());
    let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
    let (controller, _alarms) = LifecycleController::new(ctx, registry);

    let mut task = datagen_task("orders");
    task.nodes = vec![NodeId::new("node-a")];
    controller.start_local(task.clone()).await.unwrap();

    task.nodes = vec![NodeId::new("node-b")];
    let outcome = controller
        .apply(TaskPushCommand::new(TaskState::Working, task.clone()))
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Stopped);
    assert_eq!(controller.state_of(&task.task_id), Some(TaskState::Stopped));
}

#[tokio::test]
async fn test_stop_trigger_stops_task_and_alarms() {
    let source = ScriptedSource::new(vec![
        ScriptStep::Batch(sample_batch("t", 1, 3)),
        ScriptStep::Stop("binlog purged".into()),
    ]);
    let store = MemoryStore::new();
    let registry = registry_with(source, store.clone());
    let (ctx, notifier) = NodeContext::with_notifier(NodeId::new("node-a"));
    let mut logs = notifier.subscribe();
    let (controller, alarms) = LifecycleController::new(ctx, registry);

    let shutdown = CancellationToken::new();
    let alarm_loop = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        async move { controller.run_alarms(alarms, shutdown).await }
    });

    let mut task = task_config("orders", "scripted", "memory");
    task.pipeline = Some(fast_settings());
    task.alert_receivers = vec!["dba@example.com".to_string()];
    let task_id = task.task_id.clone();
    controller.start_local(task).await.unwrap();

    let alarm = next_alarm(&mut logs).await;
    assert_eq!(alarm.message, "select stage: binlog purged");
    assert_eq!(alarm.receivers, vec!["dba@example.com".to_string()]);

    wait_for(|| controller.state_of(&task_id) == Some(TaskState::Stopped)).await;
    assert_eq!(store.event_count(), 3);

    let status = controller.snapshot();
    assert_eq!(status.running, 0);
    assert_eq!(
        status.tasks[0].last_error.as_deref(),
        Some("select stage: binlog purged")
    );

    shutdown.cancel();
    alarm_loop.await.unwrap();
}

#[tokio::test]
async fn test_alarm_from_previous_worker_is_ignored() {
    // The first source raises a stop trigger, every later one stays quiet
    let builds = Arc::new(AtomicU64::new(0));
    let mut registry = ConnectorRegistry::with_builtins().with_memory_store(MemoryStore::new());
    registry.register_source("flaky", {
        let builds = Arc::clone(&builds);
        Arc::new(move |_: &TaskConfig| -> ConnectorResult<Box<dyn SourceConnector>> {
            let steps = if builds.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![ScriptStep::Stop("replication slot dropped".into())]
            } else {
                Vec::new()
            };
            Ok(Box::new(ScriptedSource::new(steps)))
        })
    });
    let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
    let (controller, mut alarms) = LifecycleController::new(ctx, registry);

    let mut task = task_config("orders", "flaky", "memory");
    task.pipeline = Some(fast_settings());
    let task_id = task.task_id.clone();

    controller
        .apply(TaskPushCommand::new(TaskState::Working, task.clone()))
        .await
        .unwrap();
    let stale = tokio::time::timeout(Duration::from_secs(5), alarms.recv())
        .await
        .unwrap()
        .unwrap();

    controller
        .apply(TaskPushCommand::new(TaskState::Stopped, task.clone()))
        .await
        .unwrap();
    controller
        .apply(TaskPushCommand::new(TaskState::Working, task.clone()))
        .await
        .unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 2);

    assert!(controller.handle_alarm(stale).await.is_none());
    assert_eq!(controller.state_of(&task_id), Some(TaskState::Working));
    assert!(controller.snapshot().tasks[0].last_error.is_none());

    controller.shutdown().await;
}

/// Sink that refuses every upload
#[derive(Default)]
struct BrokenSink {
    attempts: AtomicU64,
}

impl LogSink for BrokenSink {
    fn upload(&self, _log: NodeLog) -> Result<(), TelemetryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TelemetryError("log service unreachable".into()))
    }
}

#[tokio::test]
async fn test_failing_log_sink_does_not_stop_pipeline() {
    let source = ScriptedSource::new(vec![
        ScriptStep::Fail("socket closed".into()),
        ScriptStep::Batch(sample_batch("t", 1, 2)),
        ScriptStep::Stop("source gone".into()),
    ]);
    let store = MemoryStore::new();
    let registry = registry_with(source, store.clone());
    let sink = Arc::new(BrokenSink::default());
    let ctx = NodeContext::new(NodeId::new("node-a"), sink.clone());
    let (controller, mut alarms) = LifecycleController::new(ctx, registry);

    let mut task = task_config("orders", "scripted", "memory");
    task.pipeline = Some(fast_settings());
    let task_id = task.task_id.clone();
    controller.start_local(task).await.unwrap();

    let request = tokio::time::timeout(Duration::from_secs(5), alarms.recv())
        .await
        .unwrap()
        .unwrap();
    let report = controller.handle_alarm(request).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(store.event_count(), 2);
    assert_eq!(controller.state_of(&task_id), Some(TaskState::Stopped));
    assert!(sink.attempts.load(Ordering::SeqCst) >= 2, "task log and alarm were attempted");
}

#[tokio::test]
async fn test_snapshot_reports_running_stages() {
    let registry = ConnectorRegistry::with_builtins().with_memory_store(MemoryStore::new());
    let (ctx, _) = NodeContext::with_notifier(NodeId::new("node-a"));
    let (controller, _alarms) = LifecycleController::new(ctx, registry);

    controller.start_local(datagen_task("a")).await.unwrap();
    controller.start_local(datagen_task("b")).await.unwrap();
    controller.stop_local(&TaskId::new("b")).await.unwrap();

    let status = controller.snapshot();
    assert_eq!(status.running, 1);
    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.tasks[0].task_id.as_str(), "a");
    assert_eq!(status.tasks[0].stages.as_ref().unwrap().len(), 3);
    assert!(is_healthy(&status));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["tasks"][1]["state"], "STOPPED");

    let reports = controller.shutdown().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(controller.state_of(&TaskId::new("a")), Some(TaskState::Stopped));
}

#[tokio::test]
async fn test_broadcast_without_nodes_is_soft_failure() {
    let channel = InProcessChannel::default();
    let ack = publish_state_change(&channel, TaskState::Working, datagen_task("orders")).await;

    assert_eq!(ack.committed, TaskState::Working);
    assert!(ack.is_soft_failure());
}
