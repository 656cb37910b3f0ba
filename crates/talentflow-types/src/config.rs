//! Engine configuration types.
//!
//! `EngineConfig` is the `config.toml` in the data directory. Every field has
//! a default so an empty or missing file yields a working engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between delay-timer and expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Days a terminal instance is kept before archival.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Upper bound on step executions per instance (runaway-loop guard).
    #[serde(default = "default_max_steps_per_instance")]
    pub max_steps_per_instance: u32,

    /// Buffer size of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Timeout for outbound api_call requests.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Extra YAML templates loaded into the catalog at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,

    /// api_call service name -> base URL.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_steps_per_instance() -> u32 {
    1_000
}

fn default_event_capacity() -> usize {
    1_024
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_days: default_retention_days(),
            max_steps_per_instance: default_max_steps_per_instance(),
            event_capacity: default_event_capacity(),
            http_timeout_secs: default_http_timeout_secs(),
            templates_dir: None,
            services: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.max_steps_per_instance, 1_000);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
sweep_interval_secs = 5
retention_days = 90
templates_dir = "/etc/talentflow/templates"

[services]
payroll = "https://payroll.internal"
ats = "https://ats.internal/api"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.max_steps_per_instance, 1_000);
        assert_eq!(
            config.templates_dir.as_deref(),
            Some(std::path::Path::new("/etc/talentflow/templates"))
        );
        assert_eq!(config.services["payroll"], "https://payroll.internal");
    }
}
