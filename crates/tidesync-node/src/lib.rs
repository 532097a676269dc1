//! tidesync-node - Pipeline engine for change data capture tasks
//!
//! A node hosts synchronization tasks assigned by the manager. Each task runs
//! as a chain of three stages connected by bounded relays:
//!
//! ```text
//!            cluster commands (WORKING / STOPPED / DELETED)
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     LifecycleController                        │
//! │   ┌──────────────────────── TaskWorker ──────────────────────┐ │
//! │   │ SelectStage ──▶ relay ──▶ ExtractStage ──▶ relay ──▶ Load │ │
//! │   │      │                                                   │ │
//! │   │      └── IdleMonitor ──▶ NodeContext (idle registry)     │ │
//! │   └──────────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────────┘
//!                              │
//!                    NodeLog ──▶ LogSink (TASK_LOG / WARNING / ALARM)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidesync_node::{ConnectorRegistry, LifecycleController, NodeContext};
//!
//! let (ctx, notifier) = NodeContext::with_notifier(node_id);
//! let (controller, alarms) = LifecycleController::new(ctx, ConnectorRegistry::with_builtins());
//! tokio::spawn({
//!     let controller = controller.clone();
//!     async move { controller.run_alarms(alarms, shutdown).await }
//! });
//! controller.start_local(task_config).await?;
//! ```

pub mod config;
pub mod connectors;
pub mod context;
pub mod error;
pub mod event;
pub mod health;
pub mod idle;
pub mod lifecycle;
pub mod relay;
pub mod stage;
pub mod telemetry;
pub mod testing;
pub mod worker;

pub use config::{HealthConfig, NodeConfig};
pub use connectors::{ConnectorRegistry, Extractor, SourceConnector, TargetLoader};
pub use context::NodeContext;
pub use error::{ConnectorError, ConnectorResult, NodeError, Result, StageError, StageResult};
pub use event::{BatchDescriptor, Event, EventBatch, EventOp, Position};
pub use idle::{IdleMonitor, IdleNotice, IdleRegistry, IdleSettings};
pub use lifecycle::{ApplyOutcome, LifecycleController, NodeStatus, TaskStatus};
pub use relay::{BoundedRelay, RelayError, RelayReader};
pub use stage::{AlarmRequest, LoopOutcome, Stage, StageJob, StageKind, StageState};
pub use telemetry::{LogSink, Notifier, TelemetryError};
pub use worker::{StageStopReport, StopReport, TaskWorker};
