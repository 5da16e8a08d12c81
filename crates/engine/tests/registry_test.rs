//! Registry behavior across many agents: lookup, heartbeats, health and cleanup

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{drain_types, echo};
use fleetflow_core::events::types;
use fleetflow_core::{
    AgentConfig, AgentError, AgentStatus, AgentTask, BroadcastEventBus, Capability, HealthCheck,
    HealthStatus, OrchestratorError, SharedEventBus, TaskContext, TaskPriority,
};
use fleetflow_engine::worker::{HealthReporter, Lifecycle, TaskExecutor};
use fleetflow_engine::{
    AgentQuery, AgentRegistry, RegistryConfig, SharedAgent, TaskSubmitter, Worker, WorkerConfig,
};
use serde_json::{json, Map, Value};

fn worker(config: AgentConfig, agent: SharedAgent, events: &SharedEventBus) -> Arc<Worker> {
    Worker::new(
        config,
        WorkerConfig::default().with_memory_threshold_mb(None),
        agent,
        events.clone(),
    )
}

/// Agent whose shutdown hook fails and whose API dependency is down
struct Stubborn;

#[async_trait]
impl Lifecycle for Stubborn {
    async fn on_shutdown(&self) -> Result<(), AgentError> {
        Err(AgentError::new("SHUTDOWN_FAILED", "socket still open"))
    }
}

#[async_trait]
impl TaskExecutor for Stubborn {
    fn can_handle(&self, _task: &AgentTask) -> bool {
        true
    }

    async fn execute(&self, _task: &AgentTask) -> Result<Value, AgentError> {
        Ok(Value::Null)
    }
}

#[async_trait]
impl HealthReporter for Stubborn {
    async fn dependency_checks(&self) -> Vec<HealthCheck> {
        vec![HealthCheck::fail("publishing-api", "connection refused")]
    }
}

async fn content_team(events: &SharedEventBus) -> Arc<AgentRegistry> {
    let registry = AgentRegistry::new(RegistryConfig::default(), events.clone());
    let agents = [
        AgentConfig::new("writer", "Content Writer")
            .with_tag("content")
            .with_capability(Capability::new("draft")),
        AgentConfig::new("editor", "Copy Editor")
            .with_tag("content")
            .with_tag("review")
            .with_capability(Capability::new("draft"))
            .with_capability(Capability::new("proofread")),
        AgentConfig::new("scheduler", "Post Scheduler").with_tag("ops"),
    ];
    for config in agents {
        let id = config.id.clone();
        registry
            .register(worker(config, echo(), events), Map::new())
            .await
            .unwrap();
        if id != "scheduler" {
            registry.start_agent(&id).await.unwrap();
        }
    }
    registry
}

fn ids(workers: Vec<Arc<Worker>>) -> Vec<String> {
    workers.iter().map(|w| w.id().to_string()).collect()
}

#[test_log::test(tokio::test)]
async fn test_find_agents_combines_criteria_in_registration_order() {
    let events = BroadcastEventBus::shared();
    let registry = content_team(&events).await;

    assert_eq!(
        ids(registry.find_agents(&AgentQuery::new().with_tag("content"))),
        vec!["writer", "editor"]
    );
    assert_eq!(
        ids(registry.find_agents(
            &AgentQuery::new()
                .with_tag("content")
                .with_capability("proofread")
        )),
        vec!["editor"]
    );
    assert_eq!(
        ids(registry.find_agents(&AgentQuery::new().with_status(AgentStatus::Running))),
        vec!["writer", "editor"]
    );
    assert_eq!(
        ids(registry.find_agents(&AgentQuery::new().name_contains("SCHED"))),
        vec!["scheduler"]
    );
    assert!(registry
        .find_agents(&AgentQuery::new().with_tag("unknown"))
        .is_empty());
    assert_eq!(registry.agents_with_capability("draft"), vec!["editor", "writer"]);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_id_is_rejected() {
    let events = BroadcastEventBus::shared();
    let registry = content_team(&events).await;

    let err = registry
        .register(
            worker(AgentConfig::new("writer", "Impostor"), echo(), &events),
            Map::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::DuplicateId(id) if id == "writer"));
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.get("writer").unwrap().config().name, "Content Writer");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_heartbeat_monitor_flags_and_heartbeat_recovers() {
    let events = BroadcastEventBus::shared();
    let registry = AgentRegistry::new(
        RegistryConfig::default()
            .with_heartbeat_check_interval(Duration::from_secs(1))
            .with_heartbeat_timeout(Duration::from_secs(3)),
        events.clone(),
    );
    // Worker beats far less often than the registry expects
    let silent = Worker::new(
        AgentConfig::new("silent", "Silent"),
        WorkerConfig::default()
            .with_memory_threshold_mb(None)
            .with_heartbeat_interval(Duration::from_secs(60)),
        echo(),
        events.clone(),
    );
    registry.register(silent.clone(), Map::new()).await.unwrap();
    registry.start_agent("silent").await.unwrap();

    let mut rx = events.subscribe();
    registry.start_heartbeat_monitor();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(silent.status(), AgentStatus::Error);
    assert!(silent.is_heartbeat_flagged());
    let health = registry.get_system_health().await;
    assert_eq!(health.overall, HealthStatus::Degraded);

    silent.heartbeat();
    assert_eq!(silent.status(), AgentStatus::Running);

    let seen = drain_types(&mut rx, "agent.");
    let timeouts = seen
        .iter()
        .filter(|t| t.as_str() == types::AGENT_HEARTBEAT_TIMEOUT)
        .count();
    // Flagged once, not on every check while overdue
    assert_eq!(timeouts, 1);
    assert!(seen.iter().any(|t| t == types::AGENT_RECOVERED));

    registry.cleanup().await;
}

#[test_log::test(tokio::test)]
async fn test_system_health_and_metrics() {
    let events = BroadcastEventBus::shared();
    let registry = content_team(&events).await;
    registry
        .register(
            worker(AgentConfig::new("stubborn", "Stubborn"), Arc::new(Stubborn), &events),
            Map::new(),
        )
        .await
        .unwrap();

    let submitter = TaskSubmitter::new(registry.clone());
    for n in 0..3 {
        submitter
            .submit_and_wait(
                "writer",
                "echo",
                json!({"n": n}).as_object().cloned().unwrap(),
                TaskPriority::Normal,
                TaskContext::new(),
            )
            .await
            .unwrap();
    }

    let metrics = registry.get_system_metrics();
    assert_eq!(metrics.total_agents, 4);
    assert_eq!(metrics.tasks_processed, 3);
    assert_eq!(metrics.tasks_successful, 3);
    assert_eq!(metrics.by_status.get(&AgentStatus::Running), Some(&2));

    let health = registry.get_system_health().await;
    assert_eq!(health.agents.len(), 4);
    assert_eq!(health.overall, HealthStatus::Unhealthy);
    assert_eq!(health.counts.get(&HealthStatus::Unhealthy), Some(&1));
}

#[test_log::test(tokio::test)]
async fn test_cleanup_reports_failures_and_still_empties_registry() {
    let events = BroadcastEventBus::shared();
    let registry = content_team(&events).await;
    registry
        .register(
            worker(AgentConfig::new("stubborn", "Stubborn"), Arc::new(Stubborn), &events),
            Map::new(),
        )
        .await
        .unwrap();
    registry.start_agent("stubborn").await.unwrap();

    let report = registry.cleanup().await;
    assert_eq!(report.succeeded, vec!["writer", "editor", "scheduler"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "stubborn");
    assert!(!report.is_clean());

    assert!(registry.is_empty());
    assert!(registry.agents_with_tag("content").is_empty());
}
