//! Select stage: source connector → select relay
//!
//! Each iteration fetches until the source runs dry, pushing every non-empty
//! batch under the connector's swimlane, then feeds the idle monitor with the
//! empty fetch that ended the cycle.

use super::{BatchRelay, LoopOutcome, StageJob, StageKind, TaskContext};
use crate::connectors::SourceConnector;
use crate::error::{ConnectorResult, StageError, StageResult};
use crate::event::{BatchDescriptor, EventBatch};
use crate::idle::IdleMonitor;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tidesync_common::{NodeLog, SwimlaneId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct SelectStage {
    ctx: Arc<TaskContext>,
    source: Box<dyn SourceConnector>,
    relay: Arc<BatchRelay>,
    swimlane: SwimlaneId,
    idle: IdleMonitor,
    /// Batch whose push was interrupted by cancellation
    pending: Option<EventBatch>,
}

impl SelectStage {
    pub fn new(ctx: Arc<TaskContext>, source: Box<dyn SourceConnector>, relay: Arc<BatchRelay>) -> Self {
        let swimlane = source.swimlane_id();
        let idle = IdleMonitor::new(
            ctx.task_id.clone(),
            swimlane.clone(),
            source.client_info(),
            source.idle_settings(),
        );
        Self {
            ctx,
            source,
            relay,
            swimlane,
            idle,
            pending: None,
        }
    }

    pub fn idle_monitor(&self) -> &IdleMonitor {
        &self.idle
    }

    async fn push(&mut self, batch: EventBatch, cancel: &CancellationToken) -> StageResult<()> {
        match self.relay.push(self.swimlane.clone(), batch, cancel).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.pending = Some(rejected.into_inner());
                Err(StageError::Cancelled)
            }
        }
    }

    fn check_idle(&mut self) {
        let check = self.idle.observe_empty(Utc::now());
        if let Some(notice) = check.notice {
            warn!(
                task = %self.ctx.task_id,
                swimlane = %self.swimlane,
                idle_secs = notice.idle_secs,
                "Source has consumed no data"
            );
            self.ctx
                .node
                .report(notice.to_node_log(self.ctx.alert_receivers.clone()));
        }
        self.ctx
            .node
            .flush_consumer_idle(&self.ctx.task_id, &self.swimlane, check.idle_secs);
    }
}

#[async_trait]
impl StageJob for SelectStage {
    fn kind(&self) -> StageKind {
        StageKind::Select
    }

    fn can_start(&self) -> bool {
        self.source.can_start()
    }

    async fn do_start(&mut self) -> ConnectorResult<()> {
        self.source.startup().await
    }

    async fn loop_logic(&mut self, cancel: &CancellationToken) -> StageResult<LoopOutcome> {
        if let Some(batch) = self.pending.take() {
            self.push(batch, cancel).await?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let batch = match self.source.fetch().await {
                Ok(Some(batch)) if !batch.is_empty() => batch,
                Ok(_) => break,
                Err(e) if e.is_retryable() => {
                    warn!(task = %self.ctx.task_id, swimlane = %self.swimlane, error = %e, "Fetch failed");
                    self.ctx.node.report(NodeLog::task_log(
                        self.ctx.task_id.clone(),
                        self.swimlane.clone(),
                        format!("fetch failed: {}", e),
                    ));
                    break;
                }
                Err(e) => return Err(StageError::from(e)),
            };

            debug!(task = %self.ctx.task_id, swimlane = %self.swimlane, events = batch.len(), "Fetched batch");
            metrics::counter!("tidesync_select_events_total", "task" => self.ctx.task_id.to_string())
                .increment(batch.len() as u64);
            self.idle.record_data();
            self.push(batch, cancel).await?;
        }

        self.check_idle();
        Ok(LoopOutcome::Idle)
    }

    async fn do_stop(&mut self) -> Vec<BatchDescriptor> {
        let mut discarded = Vec::new();
        if let Some(batch) = self.pending.take() {
            let timeout = self.ctx.settings.drain_timeout();
            if let Err(rejected) = self.relay.push_timeout(self.swimlane.clone(), batch, timeout).await {
                let desc = rejected.into_inner().describe();
                warn!(task = %self.ctx.task_id, swimlane = %self.swimlane, batch = %desc, "Discarding fetched batch, relay stayed full");
                discarded.push(desc);
            }
        }
        if let Err(e) = self.source.shutdown().await {
            warn!(task = %self.ctx.task_id, error = %e, "Source shutdown failed");
        }
        discarded
    }

    fn output(&self) -> Option<Arc<BatchRelay>> {
        Some(Arc::clone(&self.relay))
    }
}
