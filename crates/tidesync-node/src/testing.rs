//! Test doubles for pipeline tests
//!
//! ```rust,ignore
//! use tidesync_node::testing::*;
//!
//! let source = ScriptedSource::new(vec![
//!     ScriptStep::Batch(sample_batch("shop.orders", 1, 3)),
//!     ScriptStep::Empty,
//!     ScriptStep::Stop("binlog purged".into()),
//! ]);
//! let store = MemoryStore::new();
//! let registry = registry_with(source, store.clone());
//! ```

use crate::connectors::{
    ConnectorRegistry, LoaderFactory, MemoryLoader, MemoryStore, SourceConnector, SourceFactory,
    TargetLoader,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventBatch, EventOp, Position};
use crate::idle::IdleSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tidesync_common::{SourceSpec, SwimlaneId, TargetSpec, TaskConfig, TaskId};

/// One scripted fetch result
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Batch(EventBatch),
    Empty,
    /// Retryable fetch error
    Fail(String),
    /// Stop trigger
    Stop(String),
}

/// Shared view of what a [`ScriptedSource`] went through
#[derive(Debug, Clone, Default)]
pub struct SourceProbe {
    fetches: Arc<AtomicU64>,
    started: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

impl SourceProbe {
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Source replaying a fixed script, then returning empty fetches
pub struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
    swimlane: SwimlaneId,
    idle: IdleSettings,
    ready: bool,
    startup_error: Option<String>,
    probe: SourceProbe,
}

impl ScriptedSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            swimlane: SwimlaneId::new("0"),
            idle: IdleSettings::disabled(),
            ready: true,
            startup_error: None,
            probe: SourceProbe::default(),
        }
    }

    pub fn with_swimlane(mut self, swimlane: impl Into<String>) -> Self {
        self.swimlane = SwimlaneId::new(swimlane);
        self
    }

    pub fn with_idle_settings(mut self, idle: IdleSettings) -> Self {
        self.idle = idle;
        self
    }

    /// Fail the readiness check
    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Fail `startup` with a connection error
    pub fn failing_startup(mut self, message: impl Into<String>) -> Self {
        self.startup_error = Some(message.into());
        self
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl SourceConnector for ScriptedSource {
    async fn startup(&mut self) -> ConnectorResult<()> {
        if let Some(message) = &self.startup_error {
            return Err(ConnectorError::Connection(message.clone()));
        }
        self.probe.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) -> ConnectorResult<()> {
        self.probe.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&mut self) -> ConnectorResult<Option<EventBatch>> {
        self.probe.fetches.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(ScriptStep::Batch(batch)) => Ok(Some(batch)),
            Some(ScriptStep::Empty) | None => Ok(None),
            Some(ScriptStep::Fail(message)) => Err(ConnectorError::transient(message)),
            Some(ScriptStep::Stop(reason)) => Err(ConnectorError::stop_trigger(reason)),
        }
    }

    fn can_start(&self) -> bool {
        self.ready
    }

    fn swimlane_id(&self) -> SwimlaneId {
        self.swimlane.clone()
    }

    fn client_info(&self) -> String {
        format!("scripted://{}", self.swimlane)
    }

    fn idle_settings(&self) -> IdleSettings {
        self.idle
    }
}

/// Loader that fails its first `failures` loads, then stores batches
pub struct FailingLoader {
    remaining_failures: Option<u64>,
    fatal: bool,
    attempts: Arc<AtomicU64>,
    inner: MemoryLoader,
}

impl FailingLoader {
    /// Fail every load with a retryable error
    pub fn always(store: MemoryStore) -> Self {
        Self {
            remaining_failures: None,
            fatal: false,
            attempts: Arc::new(AtomicU64::new(0)),
            inner: MemoryLoader::new(store),
        }
    }

    /// Fail the first `failures` loads with a retryable error
    pub fn times(failures: u64, store: MemoryStore) -> Self {
        Self {
            remaining_failures: Some(failures),
            ..Self::always(store)
        }
    }

    /// Fail every load with a stop trigger
    pub fn fatal(store: MemoryStore) -> Self {
        Self {
            fatal: true,
            ..Self::always(store)
        }
    }

    /// Shared attempt counter
    pub fn attempts(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl TargetLoader for FailingLoader {
    async fn load(&mut self, batch: &EventBatch) -> ConnectorResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fatal {
            return Err(ConnectorError::stop_trigger("target rejected writes"));
        }
        let failing = match &mut self.remaining_failures {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        };
        if failing {
            return Err(ConnectorError::Connection(format!("write attempt {} refused", attempt)));
        }
        self.inner.load(batch).await
    }
}

/// Batch of `count` insert events with positions `first..first + count`
pub fn sample_batch(table: &str, first: u64, count: u64) -> EventBatch {
    (first..first + count)
        .map(|n| {
            Event::new(
                table,
                EventOp::Insert,
                Position::new(n.to_string()),
                serde_json::json!({ "id": n }),
            )
        })
        .collect()
}

/// Minimal task snapshot
pub fn task_config(task_id: &str, source: &str, target: &str) -> TaskConfig {
    TaskConfig {
        task_id: TaskId::new(task_id),
        source: SourceSpec::new(source),
        target: TargetSpec::new(target),
        mappings: Vec::new(),
        unmapped_tables: Default::default(),
        nodes: Vec::new(),
        alert_receivers: Vec::new(),
        pipeline: None,
    }
}

/// Source factory handing out `source` once
pub fn once_source(source: ScriptedSource) -> Arc<dyn SourceFactory> {
    let slot = Mutex::new(Some(source));
    Arc::new(move |_: &TaskConfig| -> ConnectorResult<Box<dyn SourceConnector>> {
        slot.lock()
            .take()
            .map(|s| Box::new(s) as Box<dyn SourceConnector>)
            .ok_or_else(|| ConnectorError::config("scripted source already used"))
    })
}

/// Loader factory handing out `loader` once
pub fn once_loader<L: TargetLoader + 'static>(loader: L) -> Arc<dyn LoaderFactory> {
    let slot = Mutex::new(Some(loader));
    Arc::new(move |_: &TaskConfig| -> ConnectorResult<Box<dyn TargetLoader>> {
        slot.lock()
            .take()
            .map(|l| Box::new(l) as Box<dyn TargetLoader>)
            .ok_or_else(|| ConnectorError::config("loader already used"))
    })
}

/// Built-in registry plus a `scripted` source and a `memory` sink on `store`
pub fn registry_with(source: ScriptedSource, store: MemoryStore) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::with_builtins().with_memory_store(store);
    registry.register_source("scripted", once_source(source));
    registry
}
