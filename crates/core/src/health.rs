// Health reporting
//
// Worker health is a list of pass/warn/fail checks. Only a failing check
// makes an agent unhealthy; warnings are informational. Agents flagged by the
// heartbeat monitor report degraded until their next heartbeat.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_value: Option<f64>,
}

impl HealthCheck {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Pass,
            message: None,
            observed_value: None,
        }
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            message: Some(message.into()),
            observed_value: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Fail,
            message: Some(message.into()),
            observed_value: None,
        }
    }

    pub fn with_observed_value(mut self, value: f64) -> Self {
        self.observed_value = Some(value);
        self
    }
}

/// Aggregate health, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worst status wins: unhealthy > degraded > healthy
    pub fn aggregate<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses
            .into_iter()
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_id: String,
    pub status: HealthStatus,
    pub agent_status: AgentStatus,
    pub checks: Vec<HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report: any failing check makes it unhealthy, otherwise `baseline`
    pub fn from_checks(
        agent_id: impl Into<String>,
        agent_status: AgentStatus,
        checks: Vec<HealthCheck>,
        baseline: HealthStatus,
    ) -> Self {
        let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else {
            baseline
        };
        Self {
            agent_id: agent_id.into(),
            status,
            agent_status,
            checks,
            checked_at: Utc::now(),
        }
    }
}

/// Health of every registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub agents: Vec<HealthReport>,
    pub counts: HashMap<HealthStatus, usize>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn from_reports(agents: Vec<HealthReport>) -> Self {
        let overall = HealthStatus::aggregate(agents.iter().map(|r| r.status));
        let mut counts = HashMap::new();
        for report in &agents {
            *counts.entry(report.status).or_insert(0) += 1;
        }
        Self {
            overall,
            agents,
            counts,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_flip_status() {
        let report = HealthReport::from_checks(
            "a",
            AgentStatus::Running,
            vec![HealthCheck::pass("liveness"), HealthCheck::warn("memory", "high")],
            HealthStatus::Healthy,
        );
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_any_failure_is_unhealthy() {
        let report = HealthReport::from_checks(
            "a",
            AgentStatus::Running,
            vec![HealthCheck::pass("liveness"), HealthCheck::fail("db", "down")],
            HealthStatus::Degraded,
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_aggregate_priority_order() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::aggregate(vec![]), Healthy);
        assert_eq!(HealthStatus::aggregate(vec![Healthy, Degraded]), Degraded);
        assert_eq!(
            HealthStatus::aggregate(vec![Degraded, Unhealthy, Healthy]),
            Unhealthy
        );
    }

    #[test]
    fn test_system_health_counts() {
        let reports = vec![
            HealthReport::from_checks("a", AgentStatus::Running, vec![], HealthStatus::Healthy),
            HealthReport::from_checks("b", AgentStatus::Error, vec![], HealthStatus::Degraded),
            HealthReport::from_checks("c", AgentStatus::Running, vec![], HealthStatus::Healthy),
        ];
        let system = SystemHealth::from_reports(reports);
        assert_eq!(system.overall, HealthStatus::Degraded);
        assert_eq!(system.counts[&HealthStatus::Healthy], 2);
        assert_eq!(system.counts[&HealthStatus::Degraded], 1);
    }
}
