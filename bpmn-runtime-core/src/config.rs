//! Engine configuration: defaults plus YAML loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The kind of runtime the engine is bound to. Handlers and egress adapters
/// declare which kinds they support; binding an unsupported adapter fails at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Process,
    ServerlessWorkflow,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime_kind: RuntimeKind,

    /// Agenda steps allowed per run to quiescence. Exceeding it drives the
    /// instance to ERROR (guards against cyclic graphs without wait states).
    pub max_steps: usize,

    /// Chained follow-up transitions allowed per work item operation.
    pub max_transition_hops: usize,

    /// Work item name used for `external` scope signals.
    pub external_send_task_name: String,

    /// Work item name served by the built-in message send handler.
    pub send_task_name: String,

    /// Work item name served by the built-in human task handler.
    pub human_task_name: String,

    /// Keep COMPLETED/ABORTED/ERROR instances in the registry for inspection.
    pub retain_terminal_instances: bool,

    /// Capacity of bounded channels created for channel-backed listeners.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime_kind: RuntimeKind::Process,
            max_steps: 10_000,
            max_transition_hops: 8,
            external_send_task_name: "External Send Task".to_string(),
            send_task_name: "Send Task".to_string(),
            human_task_name: "Human Task".to_string(),
            retain_terminal_instances: true,
            event_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Parse from a YAML document. Missing keys fall back to defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Parsing engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            anyhow::bail!("max_steps must be positive");
        }
        if self.max_transition_hops == 0 {
            anyhow::bail!("max_transition_hops must be positive");
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be positive");
        }
        for (key, value) in [
            ("external_send_task_name", &self.external_send_task_name),
            ("send_task_name", &self.send_task_name),
            ("human_task_name", &self.human_task_name),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{key} must not be blank");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.external_send_task_name, "External Send Task");
        assert_eq!(config.runtime_kind, RuntimeKind::Process);
        assert!(config.retain_terminal_instances);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            "runtime_kind: serverless_workflow\nmax_steps: 50\n",
        )
        .unwrap();
        assert_eq!(config.runtime_kind, RuntimeKind::ServerlessWorkflow);
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.send_task_name, "Send Task");
    }

    #[test]
    fn test_rejects_blank_names_and_zero_limits() {
        assert!(EngineConfig::from_yaml_str("human_task_name: ' '\n").is_err());
        assert!(EngineConfig::from_yaml_str("max_steps: 0\n").is_err());
    }

    #[test]
    fn test_load_from_missing_file_reports_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("/nonexistent/engine.yaml"));
    }
}
