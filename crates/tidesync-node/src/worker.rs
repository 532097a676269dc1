//! Task worker
//!
//! A [`TaskWorker`] owns one task's stage chain and its relays. Start-up runs
//! source first; shutdown drains stage by stage so no fetched batch is lost
//! silently:
//!
//! ```text
//! stop():
//!   cancel select  → join → wait select relay drained (≤ drain_timeout)
//!   cancel extract → join → wait extract relay drained (≤ drain_timeout)
//!   cancel load    → join
//! ```
//!
//! A relay that does not drain in time is emptied and every discarded batch is
//! named in a warning and in the returned [`StopReport`].

use crate::connectors::ConnectorRegistry;
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::event::BatchDescriptor;
use crate::relay::BoundedRelay;
use crate::stage::{
    AlarmSender, ExtractStage, LoadStage, SelectStage, Stage, StageHandle, StageKind, StageRunner,
    StageState, TaskContext,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tidesync_common::{NodeLog, TaskConfig, TaskId, TaskState};
use tracing::{info, warn};

/// Extra time a stage gets to finish its own drain before it is aborted
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Built,
    Running,
    Stopped,
}

/// How one stage came down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStopReport {
    pub stage: StageKind,
    /// The stage loop exited on its own before the join timeout
    pub joined: bool,
    /// The stage's output relay was empty when the next stage was stopped
    pub drained: bool,
    /// Batches that never reached the next stage
    pub discarded: Vec<BatchDescriptor>,
}

/// Outcome of stopping a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub task_id: TaskId,
    pub stages: Vec<StageStopReport>,
}

impl StopReport {
    fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            stages: Vec::new(),
        }
    }

    /// Every relay drained and nothing was discarded
    pub fn is_clean(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.joined && s.drained && s.discarded.is_empty())
    }

    pub fn discarded(&self) -> impl Iterator<Item = &BatchDescriptor> {
        self.stages.iter().flat_map(|s| s.discarded.iter())
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageStopReport> {
        self.stages.iter().find(|s| s.stage == kind)
    }
}

/// Status of one stage for health output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: StageKind,
    pub state: StageState,
    /// Pending batches in the stage's output relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<usize>,
}

/// Runs one task's pipeline
pub struct TaskWorker {
    ctx: Arc<TaskContext>,
    alarms: AlarmSender,
    state: WorkerState,
    runners: Vec<StageRunner>,
    handles: Vec<StageHandle>,
    last_report: Option<StopReport>,
}

impl TaskWorker {
    /// Wire the stage chain of a task from its snapshot
    pub fn build(
        config: &TaskConfig,
        node: Arc<NodeContext>,
        registry: &ConnectorRegistry,
        alarms: AlarmSender,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = TaskContext::new(config, node);
        let settings = &ctx.settings;
        settings.validate()?;

        let source = registry.create_source(config)?;
        let extractor = registry.create_extractor(config);
        let loader = registry.create_loader(config)?;

        let select_relay = Arc::new(BoundedRelay::new(
            format!("{}.select", config.task_id),
            settings.select_capacity,
            settings.fetch_batch_hint,
            settings.swimlane_policy,
        ));
        let extract_relay = Arc::new(BoundedRelay::new(
            format!("{}.extract", config.task_id),
            settings.extract_capacity,
            settings.fetch_batch_hint,
            settings.swimlane_policy,
        ));

        let select = SelectStage::new(Arc::clone(&ctx), source, Arc::clone(&select_relay));
        let extract = ExtractStage::new(
            Arc::clone(&ctx),
            select_relay.reader(),
            extractor,
            Arc::clone(&extract_relay),
        );
        let load = LoadStage::new(Arc::clone(&ctx), extract_relay.reader(), loader);

        Ok(Self {
            ctx,
            alarms,
            state: WorkerState::Built,
            runners: vec![
                StageRunner::new(Stage::Select(select)),
                StageRunner::new(Stage::Extract(extract)),
                StageRunner::new(Stage::Load(load)),
            ],
            handles: Vec::new(),
            last_report: None,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.ctx.task_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// Generation stamped on this worker's alarm requests
    pub fn generation(&self) -> u64 {
        self.ctx.generation
    }

    pub fn last_report(&self) -> Option<&StopReport> {
        self.last_report.as_ref()
    }

    /// Per-stage state and relay depth
    pub fn status(&self) -> Vec<StageStatus> {
        if self.handles.is_empty() {
            return self
                .runners
                .iter()
                .map(|r| StageStatus {
                    stage: r.kind(),
                    state: r.state(),
                    pending: r.output().map(|relay| relay.size()),
                })
                .collect();
        }
        self.handles
            .iter()
            .map(|h| StageStatus {
                stage: h.kind(),
                state: h.state(),
                pending: h.output().map(|relay| relay.size()),
            })
            .collect()
    }

    /// Start every stage, source first
    pub async fn start(&mut self) -> Result<()> {
        if self.state != WorkerState::Built {
            return Err(NodeError::InvalidState {
                task: self.ctx.task_id.clone(),
                operation: "start",
                state: match self.state {
                    WorkerState::Running => TaskState::Working,
                    _ => TaskState::Stopped,
                },
            });
        }

        if let Some(runner) = self.runners.iter().find(|r| !r.can_start()) {
            return Err(NodeError::NotReady {
                task: self.ctx.task_id.clone(),
                stage: runner.kind(),
            });
        }

        for i in 0..self.runners.len() {
            if let Err(e) = self.runners[i].start().await {
                let stage = self.runners[i].kind();
                warn!(task = %self.ctx.task_id, stage = %stage, error = %e, "Stage failed to start, releasing started stages");
                for started in self.runners[..i].iter_mut().rev() {
                    started.release().await;
                }
                self.state = WorkerState::Stopped;
                return Err(NodeError::StartFailed {
                    task: self.ctx.task_id.clone(),
                    stage,
                    message: e.to_string(),
                });
            }
        }

        // Spawn downstream first so the select loop never pushes into a relay
        // nobody pulls from.
        let mut runners = std::mem::take(&mut self.runners);
        let mut handles = Vec::with_capacity(runners.len());
        while let Some(runner) = runners.pop() {
            handles.push(runner.spawn(Arc::clone(&self.ctx), self.alarms.clone()));
        }
        handles.reverse();
        self.handles = handles;
        self.state = WorkerState::Running;

        info!(task = %self.ctx.task_id, swimlane = %self.ctx.swimlane_id, "Task worker started");
        metrics::gauge!("tidesync_tasks_running").increment(1.0);
        Ok(())
    }

    /// Stop the pipeline, draining each relay in order; idempotent
    pub async fn stop(&mut self) -> StopReport {
        if self.state != WorkerState::Running {
            self.state = WorkerState::Stopped;
            return self
                .last_report
                .clone()
                .unwrap_or_else(|| StopReport::empty(self.ctx.task_id.clone()));
        }

        let drain_timeout = self.ctx.settings.drain_timeout();
        let join_timeout = drain_timeout * 2 + JOIN_GRACE;
        let mut handles = std::mem::take(&mut self.handles);
        let mut report = StopReport::empty(self.ctx.task_id.clone());

        for i in 0..handles.len() {
            let (current, rest) = handles.split_at_mut(i + 1);
            let handle = &mut current[i];
            let downstream = rest.first();
            let kind = handle.kind();

            handle.cancel();
            let joined = handle.join(join_timeout).await;
            let mut stage_report = StageStopReport {
                stage: kind,
                joined: joined.is_some(),
                drained: true,
                discarded: joined.unwrap_or_default(),
            };

            if let Some(relay) = handle.output() {
                let drained = match downstream {
                    Some(next) if !next.is_finished() => tokio::select! {
                        drained = relay.wait_drained(drain_timeout) => drained,
                        _ = next.finished() => relay.is_empty(),
                    },
                    _ => relay.is_empty(),
                };
                if !drained {
                    for (lane, batch) in relay.drain_remaining() {
                        let desc = batch.describe();
                        warn!(
                            task = %self.ctx.task_id,
                            stage = %kind,
                            swimlane = %lane,
                            batch = %desc,
                            "Relay did not drain, discarding batch"
                        );
                        stage_report.discarded.push(desc);
                    }
                }
                stage_report.drained = drained;
            }

            if !stage_report.discarded.is_empty() {
                let names: Vec<String> = stage_report.discarded.iter().map(|d| d.to_string()).collect();
                self.ctx.node.report(NodeLog::task_log(
                    self.ctx.task_id.clone(),
                    self.ctx.swimlane_id.clone(),
                    format!(
                        "{} stage drain failed, discarded {} batches: {}",
                        kind,
                        names.len(),
                        names.join(", ")
                    ),
                ));
            }
            report.stages.push(stage_report);
        }

        self.ctx.node.idle().remove_task(&self.ctx.task_id);
        self.state = WorkerState::Stopped;
        metrics::gauge!("tidesync_tasks_running").decrement(1.0);
        info!(
            task = %self.ctx.task_id,
            clean = report.is_clean(),
            discarded = report.discarded().count(),
            "Task worker stopped"
        );
        self.last_report = Some(report.clone());
        report
    }

    /// Stop the pipeline and raise a task alarm
    pub async fn stop_and_alarm(&mut self, reason: &str) -> StopReport {
        if self.is_running() {
            self.ctx.node.report(
                NodeLog::alarm(self.ctx.task_id.clone(), reason)
                    .with_swimlane(self.ctx.swimlane_id.clone())
                    .with_receivers(self.ctx.alert_receivers.clone()),
            );
        }
        self.stop().await
    }
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("task_id", &self.ctx.task_id)
            .field("state", &self.state)
            .finish()
    }
}
