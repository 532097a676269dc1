//! Per-node task lifecycle
//!
//! The controller keeps one entry per hosted task and applies lifecycle
//! commands to it. Commands arrive at least once and possibly out of order,
//! so every transition is idempotent:
//!
//! | Current  | WORKING              | STOPPED        | DELETED            |
//! |----------|----------------------|----------------|--------------------|
//! | (none)   | build + start        | record STOPPED | record tombstone   |
//! | NEW      | build + start        | STOPPED        | DELETED            |
//! | WORKING  | unchanged            | stop           | stop + DELETED     |
//! | STOPPED  | rebuild + start      | unchanged      | DELETED            |
//! | DELETED  | rejected             | rejected       | unchanged          |
//!
//! `NEW` is a manager-side state and is ignored on nodes. A failed start
//! leaves the previous state in place.
//!
//! Stages that hit a stop trigger do not stop their own task; they send an
//! [`AlarmRequest`] that [`LifecycleController::run_alarms`] serves.

use crate::connectors::ConnectorRegistry;
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::idle::IdleStatus;
use crate::stage::{AlarmReceiver, AlarmRequest, AlarmSender};
use crate::worker::{StageStatus, StopReport, TaskWorker};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_common::{
    ClusterCommandChannel, CommandSubscription, NodeId, SwimlaneId, TaskConfig, TaskId,
    TaskPushCommand, TaskState,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of applying one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum ApplyOutcome {
    Started,
    Stopped,
    Deleted,
    /// The task already was in the requested state
    Unchanged,
    /// The command is not for this node
    Ignored,
    /// The task is deleted; the command was refused
    Rejected(String),
}

struct TaskEntry {
    state: TaskState,
    snapshot: TaskConfig,
    worker: Option<TaskWorker>,
    last_report: Option<StopReport>,
    last_error: Option<String>,
}

/// Status of one hosted task
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub updated_at: DateTime<Utc>,
    /// Stage detail, absent while the task is mid-transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageStatus>>,
    pub idle: Vec<SwimlaneIdle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwimlaneIdle {
    pub swimlane: SwimlaneId,
    #[serde(flatten)]
    pub status: IdleStatus,
}

/// Status of the node, served by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub uptime_secs: u64,
    pub running: usize,
    pub tasks: Vec<TaskStatus>,
}

/// Hosts and transitions the tasks of one node
pub struct LifecycleController {
    node: Arc<NodeContext>,
    registry: ConnectorRegistry,
    alarms: AlarmSender,
    entries: RwLock<HashMap<TaskId, Arc<Mutex<TaskEntry>>>>,
    states: DashMap<TaskId, (TaskState, DateTime<Utc>)>,
}

impl LifecycleController {
    /// Create a controller and the receiver its stages raise alarms on
    pub fn new(node: Arc<NodeContext>, registry: ConnectorRegistry) -> (Arc<Self>, AlarmReceiver) {
        let (alarms, rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            node,
            registry,
            alarms,
            entries: RwLock::new(HashMap::new()),
            states: DashMap::new(),
        });
        (controller, rx)
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Current state of a hosted task
    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.states.get(task_id).map(|entry| entry.value().0)
    }

    pub fn is_hosted(&self, task_id: &TaskId) -> bool {
        self.entries.read().contains_key(task_id)
    }

    fn entry(&self, task_id: &TaskId) -> Option<Arc<Mutex<TaskEntry>>> {
        self.entries.read().get(task_id).cloned()
    }

    fn entry_or_insert(&self, snapshot: &TaskConfig) -> Arc<Mutex<TaskEntry>> {
        let mut entries = self.entries.write();
        let entry = entries.entry(snapshot.task_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(TaskEntry {
                state: TaskState::New,
                snapshot: snapshot.clone(),
                worker: None,
                last_report: None,
                last_error: None,
            }))
        });
        Arc::clone(entry)
    }

    fn set_state(&self, entry: &mut TaskEntry, state: TaskState) {
        entry.state = state;
        self.states
            .insert(entry.snapshot.task_id.clone(), (state, Utc::now()));
    }

    /// Apply a command received from the cluster
    pub async fn apply(&self, command: TaskPushCommand) -> Result<ApplyOutcome> {
        let task_id = command.task_id.clone();
        let hosted = self.is_hosted(&task_id);
        let assigned = command.snapshot.is_assigned_to(self.node.node_id());

        if command.new_state == TaskState::New {
            debug!(task = %task_id, "Ignoring NEW, it is a manager-side state");
            return Ok(ApplyOutcome::Ignored);
        }
        if !hosted && !assigned {
            debug!(task = %task_id, state = %command.new_state, "Task is not assigned to this node");
            return Ok(ApplyOutcome::Ignored);
        }

        match command.new_state {
            TaskState::Working if !assigned => {
                info!(task = %task_id, "Task reassigned to another node, stopping local copy");
                self.stop_local(&task_id).await
            }
            TaskState::Working => self.start_local(command.snapshot).await,
            TaskState::Stopped => {
                self.entry_or_insert(&command.snapshot);
                self.stop_local(&task_id).await
            }
            TaskState::Deleted => {
                self.entry_or_insert(&command.snapshot);
                self.delete_local(&task_id).await
            }
            TaskState::New => Ok(ApplyOutcome::Ignored),
        }
    }

    /// Start (or rebuild and restart) a task from its snapshot
    pub async fn start_local(&self, snapshot: TaskConfig) -> Result<ApplyOutcome> {
        let entry = self.entry_or_insert(&snapshot);
        let mut entry = entry.lock().await;
        let task_id = snapshot.task_id.clone();

        match entry.state {
            TaskState::Deleted => return Ok(rejected(&task_id)),
            TaskState::Working if entry.worker.as_ref().is_some_and(TaskWorker::is_running) => {
                return Ok(ApplyOutcome::Unchanged)
            }
            _ => {}
        }

        let mut worker = match TaskWorker::build(&snapshot, Arc::clone(&self.node), &self.registry, self.alarms.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                error!(task = %task_id, error = %e, "Failed to build task worker");
                entry.last_error = Some(e.to_string());
                return Err(e);
            }
        };
        if let Err(e) = worker.start().await {
            error!(task = %task_id, error = %e, "Failed to start task worker");
            entry.last_error = Some(e.to_string());
            return Err(e);
        }

        entry.snapshot = snapshot;
        entry.worker = Some(worker);
        entry.last_error = None;
        self.set_state(&mut entry, TaskState::Working);
        info!(task = %task_id, "Task started");
        Ok(ApplyOutcome::Started)
    }

    /// Stop a hosted task, keeping it registered
    pub async fn stop_local(&self, task_id: &TaskId) -> Result<ApplyOutcome> {
        let entry = self
            .entry(task_id)
            .ok_or_else(|| NodeError::TaskNotFound(task_id.clone()))?;
        let mut entry = entry.lock().await;

        match entry.state {
            TaskState::Deleted => return Ok(rejected(task_id)),
            TaskState::Stopped => return Ok(ApplyOutcome::Unchanged),
            _ => {}
        }

        if let Some(mut worker) = entry.worker.take() {
            let report = worker.stop().await;
            entry.last_report = Some(report);
        }
        self.set_state(&mut entry, TaskState::Stopped);
        info!(task = %task_id, "Task stopped");
        Ok(ApplyOutcome::Stopped)
    }

    /// Force-stop a task and leave a terminal tombstone
    pub async fn delete_local(&self, task_id: &TaskId) -> Result<ApplyOutcome> {
        let entry = self
            .entry(task_id)
            .ok_or_else(|| NodeError::TaskNotFound(task_id.clone()))?;
        let mut entry = entry.lock().await;

        if entry.state == TaskState::Deleted {
            return Ok(ApplyOutcome::Unchanged);
        }
        if let Some(mut worker) = entry.worker.take() {
            let report = worker.stop().await;
            entry.last_report = Some(report);
        }
        self.node.idle().remove_task(task_id);
        self.set_state(&mut entry, TaskState::Deleted);
        info!(task = %task_id, "Task deleted");
        Ok(ApplyOutcome::Deleted)
    }

    /// Serve a stop-and-alarm request raised by a stage
    pub async fn handle_alarm(&self, request: AlarmRequest) -> Option<StopReport> {
        let entry = self.entry(&request.task_id)?;
        let mut entry = entry.lock().await;
        if entry.state != TaskState::Working {
            debug!(task = %request.task_id, state = %entry.state, "Alarm for a task that is not working");
            return None;
        }

        if entry.worker.as_ref().map(TaskWorker::generation) != Some(request.generation) {
            debug!(
                task = %request.task_id,
                generation = request.generation,
                "Ignoring alarm raised by a previous worker"
            );
            return None;
        }

        let reason = format!("{} stage: {}", request.stage, request.reason);
        let mut worker = entry.worker.take()?;
        let report = worker.stop_and_alarm(&reason).await;
        entry.last_report = Some(report.clone());
        entry.last_error = Some(reason);
        self.set_state(&mut entry, TaskState::Stopped);
        warn!(task = %request.task_id, stage = %request.stage, "Task stopped by stop trigger");
        Some(report)
    }

    /// Last stop report of a task
    pub async fn last_report(&self, task_id: &TaskId) -> Option<StopReport> {
        let entry = self.entry(task_id)?;
        let entry = entry.lock().await;
        entry.last_report.clone()
    }

    /// Consume commands from the cluster until shutdown or channel close
    pub async fn run(&self, channel: &dyn ClusterCommandChannel, shutdown: CancellationToken) {
        self.serve(channel.subscribe(), shutdown).await
    }

    /// Consume commands from an existing subscription
    pub async fn serve(&self, mut commands: CommandSubscription, shutdown: CancellationToken) {
        info!(node = %self.node.node_id(), "Listening for task commands");
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => {
                        warn!("Command channel closed");
                        break;
                    }
                },
            };

            let task_id = command.task_id.clone();
            let state = command.new_state;
            match self.apply(command).await {
                Ok(outcome) => info!(task = %task_id, state = %state, outcome = ?outcome, "Applied task command"),
                Err(e) => error!(task = %task_id, state = %state, error = %e, "Task command failed"),
            }
        }
    }

    /// Serve stop-and-alarm requests until shutdown
    pub async fn run_alarms(&self, mut alarms: AlarmReceiver, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = alarms.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.handle_alarm(request).await;
        }
    }

    /// Node status for health output
    pub fn snapshot(&self) -> NodeStatus {
        let entries: Vec<(TaskId, Arc<Mutex<TaskEntry>>)> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut tasks: Vec<TaskStatus> = entries
            .into_iter()
            .map(|(task_id, entry)| {
                let (state, updated_at) = self
                    .states
                    .get(&task_id)
                    .map(|s| *s.value())
                    .unwrap_or((TaskState::New, self.node_started()));
                let (stages, last_error) = match entry.try_lock() {
                    Ok(entry) => (
                        entry.worker.as_ref().map(TaskWorker::status),
                        entry.last_error.clone(),
                    ),
                    Err(_) => (None, None),
                };
                let idle = self
                    .node
                    .idle()
                    .for_task(&task_id)
                    .into_iter()
                    .map(|(swimlane, status)| SwimlaneIdle { swimlane, status })
                    .collect();
                TaskStatus {
                    task_id,
                    state,
                    updated_at,
                    stages,
                    idle,
                    last_error,
                }
            })
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        NodeStatus {
            node_id: self.node.node_id().clone(),
            uptime_secs: self.node.uptime_secs(),
            running: tasks.iter().filter(|t| t.state == TaskState::Working).count(),
            tasks,
        }
    }

    fn node_started(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(self.node.uptime_secs() as i64)
    }

    /// Stop every running task; called once on node shutdown
    pub async fn shutdown(&self) -> Vec<StopReport> {
        let entries: Vec<Arc<Mutex<TaskEntry>>> = self.entries.read().values().cloned().collect();
        let stops = entries.into_iter().map(|entry| async move {
            let mut entry = entry.lock().await;
            let mut worker = entry.worker.take()?;
            let report = worker.stop().await;
            entry.last_report = Some(report.clone());
            self.set_state(&mut entry, TaskState::Stopped);
            Some(report)
        });
        let reports: Vec<StopReport> = futures::future::join_all(stops).await.into_iter().flatten().collect();
        info!(stopped = reports.len(), "All tasks stopped");
        reports
    }
}

fn rejected(task_id: &TaskId) -> ApplyOutcome {
    warn!(task = %task_id, "Rejecting command for deleted task");
    ApplyOutcome::Rejected(NodeError::TaskDeleted(task_id.clone()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::MemoryStore;
    use crate::testing::{registry_with, sample_batch, task_config, ScriptStep, ScriptedSource};

    fn controller(node: &str) -> Arc<LifecycleController> {
        let (ctx, _) = NodeContext::with_notifier(NodeId::new(node));
        let source = ScriptedSource::new(vec![ScriptStep::Batch(sample_batch("t", 1, 2))]);
        let (controller, _alarms) = LifecycleController::new(ctx, registry_with(source, MemoryStore::new()));
        controller
    }

    fn command(state: TaskState) -> TaskPushCommand {
        TaskPushCommand::new(state, task_config("orders", "datagen", "memory"))
    }

    #[tokio::test]
    async fn test_new_is_ignored() {
        let controller = controller("node-a");
        assert_eq!(controller.apply(command(TaskState::New)).await.unwrap(), ApplyOutcome::Ignored);
        assert!(!controller.is_hosted(&TaskId::new("orders")));
    }

    #[tokio::test]
    async fn test_unassigned_task_is_ignored() {
        let controller = controller("node-a");
        let mut snapshot = task_config("orders", "datagen", "memory");
        snapshot.nodes = vec![NodeId::new("node-b")];

        let outcome = controller
            .apply(TaskPushCommand::new(TaskState::Working, snapshot))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_start_then_stop_is_idempotent() {
        let controller = controller("node-a");
        let id = TaskId::new("orders");

        assert_eq!(controller.apply(command(TaskState::Working)).await.unwrap(), ApplyOutcome::Started);
        assert_eq!(controller.apply(command(TaskState::Working)).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(controller.state_of(&id), Some(TaskState::Working));

        assert_eq!(controller.apply(command(TaskState::Stopped)).await.unwrap(), ApplyOutcome::Stopped);
        assert_eq!(controller.apply(command(TaskState::Stopped)).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(controller.state_of(&id), Some(TaskState::Stopped));
    }

    #[tokio::test]
    async fn test_deleted_is_terminal() {
        let controller = controller("node-a");
        controller.apply(command(TaskState::Working)).await.unwrap();

        assert_eq!(controller.apply(command(TaskState::Deleted)).await.unwrap(), ApplyOutcome::Deleted);
        assert_eq!(controller.apply(command(TaskState::Deleted)).await.unwrap(), ApplyOutcome::Unchanged);
        assert!(matches!(
            controller.apply(command(TaskState::Working)).await.unwrap(),
            ApplyOutcome::Rejected(_)
        ));
        assert!(matches!(
            controller.apply(command(TaskState::Stopped)).await.unwrap(),
            ApplyOutcome::Rejected(_)
        ));
        assert_eq!(controller.state_of(&TaskId::new("orders")), Some(TaskState::Deleted));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_previous_state() {
        let controller = controller("node-a");
        let bad = TaskPushCommand::new(TaskState::Working, task_config("orders", "oracle", "memory"));

        let err = controller.apply(bad).await.unwrap_err();
        assert!(matches!(err, NodeError::UnknownConnector(_)));
        assert_eq!(controller.state_of(&TaskId::new("orders")), None);

        let status = controller.snapshot();
        assert_eq!(status.tasks.len(), 1);
        assert_eq!(status.tasks[0].state, TaskState::New);
        assert!(status.tasks[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_local_stop_of_unknown_task() {
        let controller = controller("node-a");
        let err = controller.stop_local(&TaskId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, NodeError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_tasks() {
        let controller = controller("node-a");
        controller.apply(command(TaskState::Working)).await.unwrap();

        let reports = controller.shutdown().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(controller.state_of(&TaskId::new("orders")), Some(TaskState::Stopped));
        assert_eq!(controller.snapshot().running, 0);
    }
}
