//! Table-mapping extractor
//!
//! Readdresses each event from its source table to the mapped target table.
//! Events of tables without a mapping follow the task's
//! [`UnmappedTablePolicy`].

use super::Extractor;
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::EventBatch;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_common::{TaskConfig, TaskId, UnmappedTablePolicy};

/// Maps source tables to target tables
#[derive(Debug, Clone)]
pub struct TableMappingExtractor {
    task_id: TaskId,
    targets: HashMap<String, Arc<str>>,
    unmapped: UnmappedTablePolicy,
}

impl TableMappingExtractor {
    pub fn from_task(task: &TaskConfig) -> Self {
        let targets = task
            .mappings
            .iter()
            .map(|m| (m.source_table.clone(), Arc::from(m.target_table.as_str())))
            .collect();
        Self {
            task_id: task.task_id.clone(),
            targets,
            unmapped: task.unmapped_tables,
        }
    }
}

#[async_trait]
impl Extractor for TableMappingExtractor {
    async fn extract(&mut self, batch: &EventBatch) -> ConnectorResult<EventBatch> {
        let mut out = Vec::with_capacity(batch.len());
        for event in batch.iter() {
            match self.targets.get(event.table()) {
                Some(target) => out.push(event.retarget(Arc::clone(target))),
                None => match self.unmapped {
                    UnmappedTablePolicy::PassThrough => out.push(event.clone()),
                    UnmappedTablePolicy::Skip => {}
                    UnmappedTablePolicy::Fail => {
                        return Err(ConnectorError::stop_trigger(format!(
                            "task '{}' has no mapping for table '{}' at {}",
                            self.task_id,
                            event.table(),
                            event.position()
                        )))
                    }
                },
            }
        }
        Ok(EventBatch::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventOp, Position};
    use tidesync_common::{SourceSpec, TableMapping, TargetSpec};

    fn task(unmapped: UnmappedTablePolicy) -> TaskConfig {
        TaskConfig {
            task_id: TaskId::new("orders"),
            source: SourceSpec::new("datagen"),
            target: TargetSpec::new("memory"),
            mappings: vec![TableMapping::new("shop.orders", "dw.orders")],
            unmapped_tables: unmapped,
            nodes: Vec::new(),
            alert_receivers: Vec::new(),
            pipeline: None,
        }
    }

    fn batch() -> EventBatch {
        vec![
            Event::new("shop.orders", EventOp::Insert, Position::new("1"), serde_json::json!({})),
            Event::new("shop.audit", EventOp::Insert, Position::new("2"), serde_json::json!({})),
        ]
        .into()
    }

    #[tokio::test]
    async fn test_mapped_and_pass_through() {
        let mut extractor = TableMappingExtractor::from_task(&task(UnmappedTablePolicy::PassThrough));
        let input = batch();
        let out = extractor.extract(&input).await.unwrap();

        let tables: Vec<&str> = out.iter().map(|e| e.table()).collect();
        assert_eq!(tables, vec!["dw.orders", "shop.audit"]);
        assert_eq!(input.events()[0].table(), "shop.orders");
    }

    #[tokio::test]
    async fn test_skip_unmapped() {
        let mut extractor = TableMappingExtractor::from_task(&task(UnmappedTablePolicy::Skip));
        let out = extractor.extract(&batch()).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_unmapped_is_stop_trigger() {
        let mut extractor = TableMappingExtractor::from_task(&task(UnmappedTablePolicy::Fail));
        let err = extractor.extract(&batch()).await.unwrap_err();
        assert!(err.is_stop_trigger());
        assert!(err.to_string().contains("shop.audit"));
    }
}
