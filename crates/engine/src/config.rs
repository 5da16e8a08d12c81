//! Process-wide configuration
//!
//! Aggregates the runtime configs of the registry, workers and workflow
//! engine. Loaded from YAML (every section optional) or from `FLEETFLOW_*`
//! environment variables layered over the defaults.

use std::time::Duration;

use fleetflow_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::registry::RegistryConfig;
use crate::worker::WorkerConfig;

pub const ENV_MAX_CONCURRENT_EXECUTIONS: &str = "FLEETFLOW_MAX_CONCURRENT_EXECUTIONS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "FLEETFLOW_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "FLEETFLOW_HEARTBEAT_TIMEOUT_MS";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "FLEETFLOW_DRAIN_TIMEOUT_MS";
pub const ENV_MEMORY_THRESHOLD_MB: &str = "FLEETFLOW_MEMORY_THRESHOLD_MB";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub worker: WorkerConfig,
    pub engine: EngineConfig,
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

impl OrchestratorConfig {
    /// Defaults overridden by `FLEETFLOW_*` variables; unparsable values are ignored
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`OrchestratorConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(max) = parsed::<usize>(&lookup, ENV_MAX_CONCURRENT_EXECUTIONS) {
            config.engine.max_concurrent_executions = max;
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_HEARTBEAT_INTERVAL_MS) {
            let interval = Duration::from_millis(ms);
            config.worker.heartbeat_interval = interval;
            config.registry.heartbeat_check_interval = interval;
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_HEARTBEAT_TIMEOUT_MS) {
            config.registry.heartbeat_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_DRAIN_TIMEOUT_MS) {
            config.worker.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_MEMORY_THRESHOLD_MB) {
            // 0 or "off" disables the memory check
            config.worker.memory_threshold_mb = match raw.trim() {
                "off" | "none" => None,
                value => match value.parse::<u64>() {
                    Ok(0) => None,
                    Ok(mb) => Some(mb),
                    Err(_) => config.worker.memory_threshold_mb,
                },
            };
        }
        config
    }

    pub fn from_yaml_str(yaml: &str) -> OrchestratorResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.engine.max_concurrent_executions == 0 {
            return Err(OrchestratorError::validation(
                "engine.max_concurrent_executions must be at least 1",
            ));
        }
        if self.worker.queue_max_size == 0 {
            return Err(OrchestratorError::validation(
                "worker.queue_max_size must be at least 1",
            ));
        }
        if self.worker.heartbeat_interval.is_zero()
            || self.registry.heartbeat_check_interval.is_zero()
        {
            return Err(OrchestratorError::validation(
                "heartbeat intervals must be positive",
            ));
        }
        let timeout = self.registry.effective_heartbeat_timeout();
        if timeout <= self.worker.heartbeat_interval {
            return Err(OrchestratorError::validation(format!(
                "heartbeat timeout ({}ms) must exceed the worker heartbeat interval ({}ms)",
                timeout.as_millis(),
                self.worker.heartbeat_interval.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_MAX_CONCURRENT_EXECUTIONS, "3"),
            (ENV_HEARTBEAT_INTERVAL_MS, "500"),
            (ENV_HEARTBEAT_TIMEOUT_MS, "2000"),
            (ENV_DRAIN_TIMEOUT_MS, "not-a-number"),
            (ENV_MEMORY_THRESHOLD_MB, "off"),
        ]));

        assert_eq!(config.engine.max_concurrent_executions, 3);
        assert_eq!(config.worker.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(
            config.registry.heartbeat_check_interval,
            Duration::from_millis(500)
        );
        assert_eq!(
            config.registry.effective_heartbeat_timeout(),
            Duration::from_secs(2)
        );
        assert_eq!(config.worker.drain_timeout, WorkerConfig::default().drain_timeout);
        assert_eq!(config.worker.memory_threshold_mb, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_sections_are_optional() {
        let config = OrchestratorConfig::from_yaml_str(
            "engine:\n  max_concurrent_executions: 2\nworker:\n  drain_timeout: 1500\n",
        )
        .unwrap();
        assert_eq!(config.engine.max_concurrent_executions, 2);
        assert_eq!(config.worker.drain_timeout, Duration::from_millis(1500));
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_rejects_zero_ceiling_and_short_timeout() {
        assert!(
            OrchestratorConfig::from_yaml_str("engine:\n  max_concurrent_executions: 0\n").is_err()
        );

        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_HEARTBEAT_INTERVAL_MS, "1000"),
            (ENV_HEARTBEAT_TIMEOUT_MS, "500"),
        ]));
        assert!(config.validate().is_err());
    }
}
