//! Load stage: extract relay → target loader
//!
//! The load stage is terminal. It has no output relay, so `output()` is
//! always `None` and its pool is always empty. A batch that fails to load
//! stays pending and is retried after `retry_backoff`; once `max_retries`
//! attempts have failed the stage raises a stop trigger.

use super::{BatchRelay, Inflight, LoopOutcome, StageJob, StageKind, TaskContext};
use crate::connectors::TargetLoader;
use crate::error::{ConnectorResult, StageError, StageResult};
use crate::event::{BatchDescriptor, EventBatch};
use crate::relay::RelayReader;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct LoadStage {
    ctx: Arc<TaskContext>,
    input: RelayReader<EventBatch>,
    loader: Box<dyn TargetLoader>,
    inflight: Option<Inflight>,
}

impl LoadStage {
    pub fn new(ctx: Arc<TaskContext>, input: RelayReader<EventBatch>, loader: Box<dyn TargetLoader>) -> Self {
        Self {
            ctx,
            input,
            loader,
            inflight: None,
        }
    }
}

#[async_trait]
impl StageJob for LoadStage {
    fn kind(&self) -> StageKind {
        StageKind::Load
    }

    fn can_start(&self) -> bool {
        self.loader.can_start()
    }

    async fn do_start(&mut self) -> ConnectorResult<()> {
        self.loader.startup().await
    }

    async fn loop_logic(&mut self, _cancel: &CancellationToken) -> StageResult<LoopOutcome> {
        let mut job = match self.inflight.take() {
            Some(job) => job,
            None => match self.input.pull_by_order() {
                Some((lane, batch)) => Inflight::new(lane, batch),
                None => return Ok(LoopOutcome::Idle),
            },
        };
        if job.is_waiting() {
            self.inflight = Some(job);
            return Ok(LoopOutcome::Idle);
        }

        match self.loader.load(&job.batch).await {
            Ok(()) => {
                debug!(task = %self.ctx.task_id, swimlane = %job.lane, events = job.batch.len(), "Loaded batch");
                metrics::counter!("tidesync_load_events_total", "task" => self.ctx.task_id.to_string())
                    .increment(job.batch.len() as u64);
                Ok(LoopOutcome::Busy)
            }
            Err(e) if !e.is_retryable() => {
                let reason = format!("load of batch {} failed: {}", job.batch.describe(), e);
                self.inflight = Some(job);
                Err(StageError::StopTrigger(reason))
            }
            Err(e) => {
                let exhausted = job.fail(&self.ctx.settings);
                let message = format!(
                    "load attempt {} for batch {} failed: {}",
                    job.attempts,
                    job.batch.describe(),
                    e
                );
                self.inflight = Some(job);
                if exhausted {
                    Err(StageError::StopTrigger(format!("retries exhausted, {}", message)))
                } else {
                    Err(StageError::Retryable(message))
                }
            }
        }
    }

    async fn do_stop(&mut self) -> Vec<BatchDescriptor> {
        let mut discarded = Vec::new();
        if let Some(job) = self.inflight.take() {
            if let Err(e) = self.loader.load(&job.batch).await {
                let desc = job.batch.describe();
                warn!(task = %self.ctx.task_id, swimlane = %job.lane, batch = %desc, error = %e, "Discarding batch that could not be loaded");
                discarded.push(desc);
            }
        }
        if let Err(e) = self.loader.shutdown().await {
            warn!(task = %self.ctx.task_id, error = %e, "Target shutdown failed");
        }
        discarded
    }

    fn output(&self) -> Option<Arc<BatchRelay>> {
        None
    }

    fn is_pool_empty(&self) -> bool {
        true
    }
}
