//! Node configuration
//!
//! ```yaml
//! node:
//!   id: ${NODE_ID:-node-1}
//! health:
//!   enabled: true
//!   port: 8080
//! pipeline:
//!   select_capacity: 100
//!   drain_timeout_ms: 30000
//! tasks:
//!   - task_id: orders
//!     source:
//!       connector: datagen
//!       empty_fetch_threshold: 60
//!       empty_fetch_notice_span: 300
//!     target:
//!       connector: stdout
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing.

use crate::connectors::ConnectorRegistry;
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use tidesync_common::{NodeId, PipelineSettings, TaskConfig};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration of a node process
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub health: HealthConfig,

    /// Defaults for tasks without their own pipeline settings
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Tasks started at boot
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeSection {
    /// Node identity; generated when absent
    #[serde(default)]
    pub id: Option<NodeId>,
}

/// Health endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

impl NodeConfig {
    /// Load, expand and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML after environment expansion, without validation
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Configured node id, or a fresh one
    pub fn node_id(&self) -> NodeId {
        self.node.id.clone().unwrap_or_else(NodeId::generate)
    }

    /// Structural checks that need no connector knowledge
    pub fn validate(&self) -> Result<()> {
        self.pipeline
            .validate()
            .map_err(|e| NodeError::config(format!("pipeline: {}", e)))?;

        let mut seen = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !seen.insert(&task.task_id) {
                return Err(NodeError::config(format!(
                    "duplicate task id '{}'",
                    task.task_id
                )));
            }
        }
        Ok(())
    }

    /// Check that every task names registered connectors
    pub fn validate_connectors(&self, registry: &ConnectorRegistry) -> Result<()> {
        for task in &self.tasks {
            registry.check(task).map_err(|e| {
                NodeError::config(format!("task '{}': {}", task.task_id, e))
            })?;
        }
        Ok(())
    }
}

/// Expand `${VAR}` / `${VAR:-default}` from the environment
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tidesync_common::SwimlanePolicy;

    const SAMPLE: &str = r#"
node:
  id: node-7
health:
  enabled: true
  port: 9099
pipeline:
  select_capacity: 10
  swimlane_policy: round_robin
tasks:
  - task_id: orders
    source:
      connector: datagen
      swimlane: "3"
      empty_fetch_threshold: 60
      config:
        table: shop.orders
    target:
      connector: memory
    mappings:
      - source_table: shop.orders
        target_table: dw.orders
    alert_receivers: [ops@example.com]
"#;

    #[test]
    fn test_parse_sample() {
        let config = NodeConfig::from_yaml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node_id(), NodeId::new("node-7"));
        assert!(config.health.enabled);
        assert_eq!(config.health.port, 9099);
        assert_eq!(config.pipeline.select_capacity, 10);
        assert_eq!(config.pipeline.extract_capacity, 100);
        assert_eq!(config.pipeline.swimlane_policy, SwimlanePolicy::RoundRobin);

        let task = &config.tasks[0];
        assert_eq!(task.source.swimlane.as_str(), "3");
        assert_eq!(task.source.empty_fetch_threshold, 60);
        assert_eq!(task.source.empty_fetch_notice_span, 1800);
        assert_eq!(task.target_table("shop.orders"), Some("dw.orders"));
        assert_eq!(task.source.config["table"], "shop.orders");
    }

    #[test]
    fn test_env_expansion_with_default() {
        std::env::set_var("TIDESYNC_TEST_NODE_ID", "node-from-env");
        let expanded = expand_env_vars("a: ${TIDESYNC_TEST_NODE_ID}\nb: ${TIDESYNC_TEST_UNSET_VAR:-fallback}\n");
        assert_eq!(expanded, "a: node-from-env\nb: fallback\n");
    }

    #[test]
    fn test_missing_node_id_is_generated() {
        let config = NodeConfig::from_yaml("health:\n  enabled: false\n").unwrap();
        assert!(config.node.id.is_none());
        assert!(!config.node_id().to_string().is_empty());
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_tasks() {
        let yaml = r#"
tasks:
  - task_id: orders
    source: { connector: datagen }
    target: { connector: memory }
  - task_id: orders
    source: { connector: datagen }
    target: { connector: stdout }
"#;
        let err = NodeConfig::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("duplicate task id 'orders'"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = NodeConfig::from_yaml("pipeline:\n  extract_capacity: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_connector() {
        let yaml = "tasks:\n  - task_id: t\n    source: { connector: oracle }\n    target: { connector: memory }\n";
        let config = NodeConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        let err = config
            .validate_connectors(&ConnectorRegistry::with_builtins())
            .unwrap_err();
        assert!(err.to_string().contains("Unknown connector 'oracle'"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tasks.len(), 1);

        let err = NodeConfig::from_file("/nonexistent/tidesync.yaml").unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
