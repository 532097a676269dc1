//! Stdout target
//!
//! A simple loader that prints events for debugging.

use super::{parse_config, TargetLoader};
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventBatch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tidesync_common::TaskConfig;

/// Stdout loader configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StdoutConfig {
    #[serde(default)]
    pub format: StdoutFormat,
}

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Pretty-printed JSON
    Pretty,
    /// `table op position payload`
    Text,
}

pub struct StdoutLoader {
    config: StdoutConfig,
}

impl StdoutLoader {
    pub fn new(config: StdoutConfig) -> Self {
        Self { config }
    }

    pub fn from_task(task: &TaskConfig) -> ConnectorResult<Self> {
        Ok(Self::new(parse_config(&task.target.config)?))
    }

    fn render(&self, event: &Event) -> ConnectorResult<String> {
        let line = match self.config.format {
            StdoutFormat::Json => serde_json::to_string(event)?,
            StdoutFormat::Pretty => serde_json::to_string_pretty(event)?,
            StdoutFormat::Text => format!(
                "{} {:?} {} {}",
                event.table(),
                event.op(),
                event.position(),
                event.payload()
            ),
        };
        Ok(line)
    }
}

#[async_trait]
impl TargetLoader for StdoutLoader {
    async fn load(&mut self, batch: &EventBatch) -> ConnectorResult<()> {
        let mut out = String::new();
        for event in batch.iter() {
            out.push_str(&self.render(event)?);
            out.push('\n');
        }
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(out.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(|e| ConnectorError::Connection(format!("stdout write failed: {}", e)))
    }
}
