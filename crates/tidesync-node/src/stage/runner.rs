//! Stage loop driver
//!
//! [`StageRunner`] owns a stage until it is spawned; [`StageHandle`] is what
//! the worker keeps afterwards. The loop runs on its own tokio task:
//!
//! ```text
//! loop {
//!     cancelled?            -> exit
//!     loop_logic()
//!       Busy                -> yield, iterate
//!       Idle                -> sleep(loop_interval) or cancelled
//!       Retryable(msg)      -> warn + TASK_LOG, sleep
//!       StopTrigger(reason) -> STOPPING, raise alarm, exit
//!       Cancelled           -> exit
//! }
//! STOPPING -> do_stop() -> STOPPED
//! ```

use super::{BatchRelay, Stage, StageJob, StageKind, StageState, TaskContext};
use crate::error::{ConnectorResult, StageError};
use crate::event::BatchDescriptor;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tidesync_common::{NodeLog, TaskId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request to stop a task and raise an alarm, sent by a failing stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRequest {
    pub task_id: TaskId,
    /// Generation of the worker whose stage raised the request
    pub generation: u64,
    pub stage: StageKind,
    pub reason: String,
}

pub type AlarmSender = mpsc::UnboundedSender<AlarmRequest>;
pub type AlarmReceiver = mpsc::UnboundedReceiver<AlarmRequest>;

/// A stage that has not been spawned yet
pub struct StageRunner {
    stage: Stage,
    state: Arc<RwLock<StageState>>,
}

impl StageRunner {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: Arc::new(RwLock::new(StageState::Created)),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn state(&self) -> StageState {
        *self.state.read()
    }

    pub fn can_start(&self) -> bool {
        self.stage.can_start()
    }

    pub fn output(&self) -> Option<Arc<BatchRelay>> {
        self.stage.output()
    }

    /// Acquire the stage's resources
    ///
    /// A failed start leaves the stage in `Created`.
    pub async fn start(&mut self) -> ConnectorResult<()> {
        *self.state.write() = StageState::Starting;
        let result = self.stage.do_start().await;
        if result.is_err() {
            *self.state.write() = StageState::Created;
        }
        result
    }

    /// Release a started stage that will never be spawned
    pub async fn release(&mut self) -> Vec<BatchDescriptor> {
        *self.state.write() = StageState::Stopping;
        let discarded = self.stage.do_stop().await;
        *self.state.write() = StageState::Stopped;
        discarded
    }

    /// Run the stage loop on its own task
    pub fn spawn(self, ctx: Arc<TaskContext>, alarms: AlarmSender) -> StageHandle {
        let kind = self.stage.kind();
        let output = self.stage.output();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        *self.state.write() = StageState::Running;

        let join = tokio::spawn(run_loop(
            self.stage,
            Arc::clone(&self.state),
            cancel.clone(),
            done.clone(),
            ctx,
            alarms,
        ));

        StageHandle {
            kind,
            state: self.state,
            cancel,
            done,
            join: Some(join),
            output,
        }
    }
}

async fn run_loop(
    mut stage: Stage,
    state: Arc<RwLock<StageState>>,
    cancel: CancellationToken,
    done: CancellationToken,
    ctx: Arc<TaskContext>,
    alarms: AlarmSender,
) -> Vec<BatchDescriptor> {
    let _done = done.drop_guard();
    let kind = stage.kind();
    let interval = ctx.settings.loop_interval();
    info!(task = %ctx.task_id, stage = %kind, "Stage loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match stage.loop_logic(&cancel).await {
            Ok(super::LoopOutcome::Busy) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(super::LoopOutcome::Idle) => {}
            Err(StageError::Retryable(message)) => {
                warn!(task = %ctx.task_id, stage = %kind, "Stage iteration failed: {}", message);
                metrics::counter!("tidesync_stage_errors_total", "stage" => kind.as_str()).increment(1);
                ctx.node.report(NodeLog::task_log(
                    ctx.task_id.clone(),
                    ctx.swimlane_id.clone(),
                    format!("{} stage: {}", kind, message),
                ));
            }
            Err(StageError::StopTrigger(reason)) => {
                *state.write() = StageState::Stopping;
                error!(task = %ctx.task_id, stage = %kind, reason = %reason, "Stop trigger raised");
                let request = AlarmRequest {
                    task_id: ctx.task_id.clone(),
                    generation: ctx.generation,
                    stage: kind,
                    reason,
                };
                if alarms.send(request).is_err() {
                    warn!(task = %ctx.task_id, stage = %kind, "Alarm channel closed, stop trigger not escalated");
                }
                break;
            }
            Err(StageError::Cancelled) => break,
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    *state.write() = StageState::Stopping;
    debug!(task = %ctx.task_id, stage = %kind, "Stage loop exited, stopping");
    let discarded = stage.do_stop().await;
    *state.write() = StageState::Stopped;
    info!(task = %ctx.task_id, stage = %kind, discarded = discarded.len(), "Stage stopped");
    discarded
}

/// A running stage, as seen by its worker
pub struct StageHandle {
    kind: StageKind,
    state: Arc<RwLock<StageState>>,
    cancel: CancellationToken,
    done: CancellationToken,
    join: Option<JoinHandle<Vec<BatchDescriptor>>>,
    output: Option<Arc<BatchRelay>>,
}

impl StageHandle {
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn state(&self) -> StageState {
        *self.state.read()
    }

    pub fn output(&self) -> Option<&Arc<BatchRelay>> {
        self.output.as_ref()
    }

    /// Ask the loop to exit at its next boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop task has exited
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolve once the loop task has exited
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Wait for the loop task; aborts it when `timeout` elapses
    ///
    /// Returns the batches the stage discarded, or `None` if the task had to
    /// be aborted or was already joined.
    pub async fn join(&mut self, timeout: Duration) -> Option<Vec<BatchDescriptor>> {
        let mut join = self.join.take()?;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(discarded)) => Some(discarded),
            Ok(Err(e)) => {
                error!(stage = %self.kind, error = %e, "Stage task failed");
                *self.state.write() = StageState::Stopped;
                None
            }
            Err(_) => {
                warn!(stage = %self.kind, timeout_ms = timeout.as_millis() as u64, "Stage did not stop in time, aborting");
                join.abort();
                *self.state.write() = StageState::Stopped;
                None
            }
        }
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
