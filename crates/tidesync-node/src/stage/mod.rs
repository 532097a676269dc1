//! Pipeline stages
//!
//! A task runs three stages chained by bounded relays:
//!
//! ```text
//! ┌────────┐  select relay  ┌─────────┐  extract relay  ┌──────┐
//! │ Select │──────────────▶│ Extract │───────────────▶│ Load │
//! └────────┘               └─────────┘                └──────┘
//!  source                   extractor                  target
//! ```
//!
//! Every stage implements [`StageJob`]. The [`runner`] drives the shared state
//! machine, so a stage only supplies its readiness check, start-up, one loop
//! iteration and shutdown:
//!
//! ```text
//! CREATED ──▶ STARTING ──▶ RUNNING ──▶ STOPPING ──▶ STOPPED
//!                             │            ▲
//!                             └────────────┘  stop trigger / cancel
//! ```

pub mod extract;
pub mod load;
pub mod runner;
pub mod select;

pub use extract::ExtractStage;
pub use load::LoadStage;
pub use runner::{AlarmReceiver, AlarmRequest, AlarmSender, StageHandle, StageRunner};
pub use select::SelectStage;

use crate::context::NodeContext;
use crate::error::{ConnectorResult, StageResult};
use crate::event::{BatchDescriptor, EventBatch};
use crate::relay::BoundedRelay;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tidesync_common::{PipelineSettings, SwimlaneId, TaskConfig, TaskId};
use tokio_util::sync::CancellationToken;

/// Relay carrying event batches between two stages
pub type BatchRelay = BoundedRelay<EventBatch>;

/// Position of a stage in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Select,
    Extract,
    Load,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Select => "select",
            StageKind::Extract => "extract",
            StageKind::Load => "load",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl StageState {
    pub fn is_active(&self) -> bool {
        matches!(self, StageState::Starting | StageState::Running)
    }
}

/// Result of one successful loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Work was done; iterate again right away
    Busy,
    /// Nothing to do; pause for the loop interval
    Idle,
}

/// Task-scoped state shared by the stages of one worker
#[derive(Debug)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// Distinguishes successive workers of the same task
    pub generation: u64,
    /// Swimlane of the task's source
    pub swimlane_id: SwimlaneId,
    pub settings: PipelineSettings,
    pub alert_receivers: Vec<String>,
    pub node: Arc<NodeContext>,
}

impl TaskContext {
    pub fn new(task: &TaskConfig, node: Arc<NodeContext>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task.task_id.clone(),
            generation: node.next_generation(),
            swimlane_id: task.source.swimlane.clone(),
            settings: node.pipeline_for(task),
            alert_receivers: task.alert_receivers.clone(),
            node,
        })
    }
}

/// Capabilities every pipeline stage provides
#[async_trait]
pub trait StageJob: Send {
    fn kind(&self) -> StageKind;

    /// Readiness check before any resource is acquired
    fn can_start(&self) -> bool;

    /// Acquire the stage's resources
    async fn do_start(&mut self) -> ConnectorResult<()>;

    /// One iteration of the stage loop
    async fn loop_logic(&mut self, cancel: &CancellationToken) -> StageResult<LoopOutcome>;

    /// Flush pending data and release resources
    ///
    /// Returns the batches that could not be handed downstream.
    async fn do_stop(&mut self) -> Vec<BatchDescriptor>;

    /// Relay this stage feeds, if any
    ///
    /// The next stage consumes it through a [`RelayReader`], whose
    /// `pull_by_order` yields `(swimlane, batch)` pairs in per-swimlane order.
    /// The worker keeps the relay itself to watch its drain on stop.
    ///
    /// [`RelayReader`]: crate::relay::RelayReader
    fn output(&self) -> Option<Arc<BatchRelay>>;

    /// Whether the output relay holds nothing
    fn is_pool_empty(&self) -> bool {
        self.output().map_or(true, |relay| relay.is_empty())
    }
}

/// The closed set of stage variants
pub enum Stage {
    Select(SelectStage),
    Extract(ExtractStage),
    Load(LoadStage),
}

#[async_trait]
impl StageJob for Stage {
    fn kind(&self) -> StageKind {
        match self {
            Stage::Select(stage) => stage.kind(),
            Stage::Extract(stage) => stage.kind(),
            Stage::Load(stage) => stage.kind(),
        }
    }

    fn can_start(&self) -> bool {
        match self {
            Stage::Select(stage) => stage.can_start(),
            Stage::Extract(stage) => stage.can_start(),
            Stage::Load(stage) => stage.can_start(),
        }
    }

    async fn do_start(&mut self) -> ConnectorResult<()> {
        match self {
            Stage::Select(stage) => stage.do_start().await,
            Stage::Extract(stage) => stage.do_start().await,
            Stage::Load(stage) => stage.do_start().await,
        }
    }

    async fn loop_logic(&mut self, cancel: &CancellationToken) -> StageResult<LoopOutcome> {
        match self {
            Stage::Select(stage) => stage.loop_logic(cancel).await,
            Stage::Extract(stage) => stage.loop_logic(cancel).await,
            Stage::Load(stage) => stage.loop_logic(cancel).await,
        }
    }

    async fn do_stop(&mut self) -> Vec<BatchDescriptor> {
        match self {
            Stage::Select(stage) => stage.do_stop().await,
            Stage::Extract(stage) => stage.do_stop().await,
            Stage::Load(stage) => stage.do_stop().await,
        }
    }

    fn output(&self) -> Option<Arc<BatchRelay>> {
        match self {
            Stage::Select(stage) => stage.output(),
            Stage::Extract(stage) => stage.output(),
            Stage::Load(stage) => stage.output(),
        }
    }

    fn is_pool_empty(&self) -> bool {
        match self {
            Stage::Select(stage) => stage.is_pool_empty(),
            Stage::Extract(stage) => stage.is_pool_empty(),
            Stage::Load(stage) => stage.is_pool_empty(),
        }
    }
}

/// A batch a stage holds while it retries it
#[derive(Debug)]
pub(crate) struct Inflight {
    pub lane: SwimlaneId,
    pub batch: EventBatch,
    pub attempts: u32,
    /// Earliest time of the next attempt
    pub retry_at: Option<Instant>,
}

impl Inflight {
    pub fn new(lane: SwimlaneId, batch: EventBatch) -> Self {
        Self {
            lane,
            batch,
            attempts: 0,
            retry_at: None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }

    /// Record a failed attempt; true when the retry budget is spent
    pub fn fail(&mut self, settings: &PipelineSettings) -> bool {
        self.attempts += 1;
        self.retry_at = Some(Instant::now() + settings.retry_backoff());
        self.attempts >= settings.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Select.to_string(), "select");
        assert_eq!(serde_json::to_string(&StageKind::Load).unwrap(), "\"load\"");
        assert_eq!(serde_json::to_string(&StageState::Stopping).unwrap(), "\"STOPPING\"");
    }

    #[test]
    fn test_inflight_retry_budget() {
        let settings = PipelineSettings {
            max_retries: 2,
            retry_backoff_ms: 60_000,
            ..Default::default()
        };
        let mut inflight = Inflight::new(SwimlaneId::new("0"), EventBatch::default());
        assert!(!inflight.is_waiting());

        assert!(!inflight.fail(&settings));
        assert!(inflight.is_waiting());
        assert!(inflight.fail(&settings));
        assert_eq!(inflight.attempts, 2);
    }
}
