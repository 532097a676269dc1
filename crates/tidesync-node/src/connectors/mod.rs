//! Connector interfaces and registry
//!
//! A task pipeline talks to the outside world through three seams:
//!
//! ```text
//! ┌──────────────────┐    ┌─────────────┐    ┌────────────────┐
//! │ SourceConnector  │───▶│  Extractor  │───▶│  TargetLoader  │
//! │ (select stage)   │    │ (extract)   │    │  (load stage)  │
//! └──────────────────┘    └─────────────┘    └────────────────┘
//! ```
//!
//! Sources and loaders are built by name from the task snapshot through the
//! [`ConnectorRegistry`]. The extractor is always the table-mapping extractor
//! derived from the snapshot's mappings.
//!
//! # Built-in connectors
//!
//! | Name | Kind | Description |
//! |------|------|-------------|
//! | `datagen` | source | Synthetic change events with optional silence windows |
//! | `memory` | target | Keeps loaded batches in a shared [`MemoryStore`] |
//! | `stdout` | target | Prints loaded events |

pub mod datagen;
pub mod mapping;
pub mod memory;
pub mod stdout;

pub use datagen::{DatagenConfig, DatagenSource};
pub use mapping::TableMappingExtractor;
pub use memory::{MemoryLoader, MemoryStore};
pub use stdout::{StdoutConfig, StdoutFormat, StdoutLoader};

use crate::error::{ConnectorError, ConnectorResult, NodeError, Result};
use crate::event::EventBatch;
use crate::idle::IdleSettings;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_common::{SwimlaneId, TaskConfig};

/// Source of change events, driven by the select stage
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Acquire connections and position the reader
    async fn startup(&mut self) -> ConnectorResult<()>;

    /// Release resources; called once after the loop has exited
    async fn shutdown(&mut self) -> ConnectorResult<()>;

    /// Fetch the next batch; `None` or an empty batch means no data right now
    ///
    /// A [`ConnectorError::StopTrigger`] stops the whole task.
    async fn fetch(&mut self) -> ConnectorResult<Option<EventBatch>>;

    /// Readiness check run before `startup`
    fn can_start(&self) -> bool {
        true
    }

    /// Routing key for every batch this source produces
    fn swimlane_id(&self) -> SwimlaneId;

    /// Human-readable description used in idle notices
    fn client_info(&self) -> String;

    /// Idle alerting parameters
    fn idle_settings(&self) -> IdleSettings {
        IdleSettings::disabled()
    }
}

/// Derives target-shaped batches from captured ones
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Transform one batch; the input is left untouched so it can be retried
    async fn extract(&mut self, batch: &EventBatch) -> ConnectorResult<EventBatch>;
}

/// Destination of extracted batches, driven by the load stage
#[async_trait]
pub trait TargetLoader: Send + Sync {
    async fn startup(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    fn can_start(&self) -> bool {
        true
    }

    /// Write one batch; on error the batch stays pending and is retried
    async fn load(&mut self, batch: &EventBatch) -> ConnectorResult<()>;
}

/// Builds a source connector from a task snapshot
pub trait SourceFactory: Send + Sync {
    fn create(&self, task: &TaskConfig) -> ConnectorResult<Box<dyn SourceConnector>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&TaskConfig) -> ConnectorResult<Box<dyn SourceConnector>> + Send + Sync,
{
    fn create(&self, task: &TaskConfig) -> ConnectorResult<Box<dyn SourceConnector>> {
        self(task)
    }
}

/// Builds a target loader from a task snapshot
pub trait LoaderFactory: Send + Sync {
    fn create(&self, task: &TaskConfig) -> ConnectorResult<Box<dyn TargetLoader>>;
}

impl<F> LoaderFactory for F
where
    F: Fn(&TaskConfig) -> ConnectorResult<Box<dyn TargetLoader>> + Send + Sync,
{
    fn create(&self, task: &TaskConfig) -> ConnectorResult<Box<dyn TargetLoader>> {
        self(task)
    }
}

/// Name → factory lookup for sources and loaders
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    loaders: HashMap<String, Arc<dyn LoaderFactory>>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `datagen`, `memory` and `stdout`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source(
            "datagen",
            Arc::new(|task: &TaskConfig| -> ConnectorResult<Box<dyn SourceConnector>> {
                Ok(Box::new(DatagenSource::from_task(task)?))
            }),
        );
        registry.register_loader(
            "stdout",
            Arc::new(|task: &TaskConfig| -> ConnectorResult<Box<dyn TargetLoader>> {
                Ok(Box::new(StdoutLoader::from_task(task)?))
            }),
        );
        registry.with_memory_store(MemoryStore::new())
    }

    /// Route the `memory` loader of every task to `store`
    pub fn with_memory_store(mut self, store: MemoryStore) -> Self {
        self.register_loader(
            "memory",
            Arc::new(move |_: &TaskConfig| -> ConnectorResult<Box<dyn TargetLoader>> {
                Ok(Box::new(MemoryLoader::new(store.clone())))
            }),
        );
        self
    }

    pub fn register_source(&mut self, name: impl Into<String>, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(name.into(), factory);
    }

    pub fn register_loader(&mut self, name: impl Into<String>, factory: Arc<dyn LoaderFactory>) {
        self.loaders.insert(name.into(), factory);
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn has_loader(&self, name: &str) -> bool {
        self.loaders.contains_key(name)
    }

    /// Registered source names, sorted
    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered loader names, sorted
    pub fn loader_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Check that both connectors of a task are known
    pub fn check(&self, task: &TaskConfig) -> Result<()> {
        if !self.has_source(&task.source.connector) {
            return Err(NodeError::UnknownConnector(task.source.connector.clone()));
        }
        if !self.has_loader(&task.target.connector) {
            return Err(NodeError::UnknownConnector(task.target.connector.clone()));
        }
        Ok(())
    }

    pub fn create_source(&self, task: &TaskConfig) -> Result<Box<dyn SourceConnector>> {
        let factory = self
            .sources
            .get(&task.source.connector)
            .ok_or_else(|| NodeError::UnknownConnector(task.source.connector.clone()))?;
        Ok(factory.create(task)?)
    }

    pub fn create_extractor(&self, task: &TaskConfig) -> Box<dyn Extractor> {
        Box::new(TableMappingExtractor::from_task(task))
    }

    pub fn create_loader(&self, task: &TaskConfig) -> Result<Box<dyn TargetLoader>> {
        let factory = self
            .loaders
            .get(&task.target.connector)
            .ok_or_else(|| NodeError::UnknownConnector(task.target.connector.clone()))?;
        Ok(factory.create(task)?)
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("sources", &self.source_names())
            .field("loaders", &self.loader_names())
            .finish()
    }
}

/// Parse a connector's `config` block; an absent block yields the defaults
pub(crate) fn parse_config<T>(value: &serde_json::Value) -> ConnectorResult<T>
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ConnectorError::config(e.to_string()))
}
