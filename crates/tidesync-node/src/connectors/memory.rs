//! In-memory target
//!
//! Loaded batches are appended to a [`MemoryStore`] that can be inspected
//! from outside the pipeline. Handy for demos and tests.

use super::TargetLoader;
use crate::error::ConnectorResult;
use crate::event::{Event, EventBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared, cloneable store of loaded batches
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<Vec<EventBatch>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: EventBatch) {
        self.batches.lock().push(batch);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn event_count(&self) -> usize {
        self.batches.lock().iter().map(EventBatch::len).sum()
    }

    /// Copy of every loaded batch, in load order
    pub fn batches(&self) -> Vec<EventBatch> {
        self.batches.lock().clone()
    }

    /// Every loaded event, flattened
    pub fn events(&self) -> Vec<Event> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

/// Loader writing into a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryLoader {
    store: MemoryStore,
}

impl MemoryLoader {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl TargetLoader for MemoryLoader {
    async fn load(&mut self, batch: &EventBatch) -> ConnectorResult<()> {
        self.store.push(batch.clone());
        Ok(())
    }
}
