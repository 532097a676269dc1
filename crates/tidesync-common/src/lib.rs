//! tidesync-common - types shared between the tidesync manager and nodes
//!
//! The manager owns task definitions and pushes lifecycle changes to the
//! node hosting each task. Everything that crosses that boundary lives here:
//!
//! - [`TaskState`] and the task/node identifiers
//! - [`TaskConfig`], the task snapshot carried by every command
//! - [`TaskPushCommand`] and the [`ClusterCommandChannel`] boundary
//! - [`NodeLog`], the structured log/alert record uploaded by nodes

pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod task;

pub use command::{
    publish_state_change, ClusterCommandChannel, CommandSubscription, InProcessChannel,
    Propagation, StateChangeAck, TaskPushCommand,
};
pub use config::{
    PipelineSettings, SourceSpec, SwimlanePolicy, TableMapping, TargetSpec, TaskConfig,
    UnmappedTablePolicy,
};
pub use error::{CommonError, Result};
pub use log::{LogType, NodeLog};
pub use task::{NodeId, SwimlaneId, TaskId, TaskState};
