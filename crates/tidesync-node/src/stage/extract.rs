//! Extract stage: select relay → extractor → extract relay
//!
//! Batches keep their swimlane across the stage, so per-swimlane order is the
//! order of the select relay. A batch that keeps failing is retried up to
//! `max_retries` times before the stage raises a stop trigger.

use super::{BatchRelay, Inflight, LoopOutcome, StageJob, StageKind, TaskContext};
use crate::connectors::Extractor;
use crate::error::{ConnectorResult, StageError, StageResult};
use crate::event::{BatchDescriptor, EventBatch};
use crate::relay::RelayReader;
use async_trait::async_trait;
use std::sync::Arc;
use tidesync_common::SwimlaneId;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct ExtractStage {
    ctx: Arc<TaskContext>,
    input: RelayReader<EventBatch>,
    output: Arc<BatchRelay>,
    extractor: Box<dyn Extractor>,
    inflight: Option<Inflight>,
    /// Extracted batch whose push was interrupted by cancellation
    outgoing: Option<(SwimlaneId, EventBatch)>,
}

impl ExtractStage {
    pub fn new(
        ctx: Arc<TaskContext>,
        input: RelayReader<EventBatch>,
        extractor: Box<dyn Extractor>,
        output: Arc<BatchRelay>,
    ) -> Self {
        Self {
            ctx,
            input,
            output,
            extractor,
            inflight: None,
            outgoing: None,
        }
    }

    async fn push(&mut self, lane: SwimlaneId, batch: EventBatch, cancel: &CancellationToken) -> StageResult<()> {
        match self.output.push(lane.clone(), batch, cancel).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.outgoing = Some((lane, rejected.into_inner()));
                Err(StageError::Cancelled)
            }
        }
    }

    /// Hand a batch downstream while stopping; the descriptor if it was dropped
    async fn flush(&self, lane: SwimlaneId, batch: EventBatch) -> Option<BatchDescriptor> {
        if batch.is_empty() {
            return None;
        }
        let timeout = self.ctx.settings.drain_timeout();
        match self.output.push_timeout(lane.clone(), batch, timeout).await {
            Ok(()) => None,
            Err(rejected) => {
                let desc = rejected.into_inner().describe();
                warn!(task = %self.ctx.task_id, swimlane = %lane, batch = %desc, "Discarding extracted batch, relay stayed full");
                Some(desc)
            }
        }
    }
}

#[async_trait]
impl StageJob for ExtractStage {
    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    fn can_start(&self) -> bool {
        true
    }

    async fn do_start(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn loop_logic(&mut self, cancel: &CancellationToken) -> StageResult<LoopOutcome> {
        if let Some((lane, batch)) = self.outgoing.take() {
            self.push(lane, batch, cancel).await?;
        }

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

        match self.extractor.extract(&job.batch).await {
            Ok(extracted) => {
                if !extracted.is_empty() {
                    self.push(job.lane, extracted, cancel).await?;
                }
                Ok(LoopOutcome::Busy)
            }
            Err(e) if !e.is_retryable() => {
                self.inflight = Some(job);
                Err(StageError::from(e))
            }
            Err(e) => {
                let exhausted = job.fail(&self.ctx.settings);
                let message = format!(
                    "extract attempt {} for batch {} failed: {}",
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
        if let Some((lane, batch)) = self.outgoing.take() {
            discarded.extend(self.flush(lane, batch).await);
        }
        if let Some(job) = self.inflight.take() {
            match self.extractor.extract(&job.batch).await {
                Ok(extracted) => discarded.extend(self.flush(job.lane, extracted).await),
                Err(e) => {
                    let desc = job.batch.describe();
                    warn!(task = %self.ctx.task_id, swimlane = %job.lane, batch = %desc, error = %e, "Discarding batch that failed extraction");
                    discarded.push(desc);
                }
            }
        }
        discarded
    }

    fn output(&self) -> Option<Arc<BatchRelay>> {
        Some(Arc::clone(&self.output))
    }
}
