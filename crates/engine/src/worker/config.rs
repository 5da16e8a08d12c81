//! Worker runtime configuration

use std::time::Duration;

use fleetflow_core::serde_util::duration_millis;
use serde::{Deserialize, Serialize};

/// Runtime settings shared by every worker of a process
///
/// Agent-specific settings (concurrency, retries, timeout) live in
/// [`fleetflow_core::AgentConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How often a running worker emits a heartbeat
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Bounded wait for in-flight tasks on stop
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,

    /// Process RSS above which the resource check warns (`None` disables it)
    pub memory_threshold_mb: Option<u64>,

    /// Maximum waiting + delayed jobs per worker queue
    pub queue_max_size: usize,

    /// Finished task records kept for status queries
    pub keep_finished: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            memory_threshold_mb: Some(1024),
            queue_max_size: 10_000,
            keep_finished: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_memory_threshold_mb(mut self, threshold: Option<u64>) -> Self {
        self.memory_threshold_mb = threshold;
        self
    }

    pub fn with_queue_max_size(mut self, max: usize) -> Self {
        self.queue_max_size = max.max(1);
        self
    }

    pub fn with_keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: WorkerConfig =
            serde_yaml::from_str("heartbeat_interval: 250\nmemory_threshold_mb: null\n").unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.memory_threshold_mb, None);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }
}
