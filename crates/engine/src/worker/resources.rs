//! Process memory probe for the worker resource check

use fleetflow_core::HealthCheck;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

pub const MEMORY_CHECK: &str = "memory";

/// Samples this process's resident memory
pub struct MemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self {
            pid,
            system: Mutex::new(system),
        }
    }

    /// Current RSS in MiB, `None` if the process could not be sampled
    pub fn rss_mb(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(self.pid)
            .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
    }

    /// Warn when RSS exceeds `threshold_mb`; never fails
    pub fn check(&self, threshold_mb: u64) -> HealthCheck {
        match self.rss_mb() {
            Some(rss) if rss > threshold_mb as f64 => HealthCheck::warn(
                MEMORY_CHECK,
                format!("rss {rss:.1} MiB exceeds threshold {threshold_mb} MiB"),
            )
            .with_observed_value(rss),
            Some(rss) => HealthCheck::pass(MEMORY_CHECK).with_observed_value(rss),
            None => HealthCheck::warn(MEMORY_CHECK, "process memory unavailable"),
        }
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
