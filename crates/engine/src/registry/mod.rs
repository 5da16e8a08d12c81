//! Agent registry
//!
//! Single source of truth for which agents exist and what state they are in.
//! One explicit instance per process, shared as `Arc<AgentRegistry>`.
//!
//! - Agents are indexed by tag and by declared capability. Indexes change only
//!   on register, unregister and config update, never on task dispatch.
//! - A heartbeat monitor flags agents whose heartbeat is overdue. The flag is
//!   reported, not fatal: the agent keeps running and recovers on its next beat.
//! - Agents publishing on a different event bus are forwarded into the
//!   registry's bus.

mod query;

pub use query::AgentQuery;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetflow_core::events::{same_bus, types, Event, Severity};
use fleetflow_core::serde_util::{duration_millis, option_duration_millis};
use fleetflow_core::{
    AgentConfig, AgentMetrics, AgentStatus, OrchestratorError, OrchestratorResult,
    SharedEventBus, SystemHealth,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::ticker::Ticker;
use crate::worker::Worker;

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the heartbeat monitor runs
    #[serde(with = "duration_millis")]
    pub heartbeat_check_interval: Duration,

    /// Overdue threshold; defaults to three check intervals
    #[serde(with = "option_duration_millis")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_check_interval: Duration::from_secs(10),
            heartbeat_timeout: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_heartbeat_check_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_check_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn effective_heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
            .unwrap_or(self.heartbeat_check_interval * 3)
    }
}

/// A registered agent as seen from outside
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub worker: Arc<Worker>,
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
}

/// Aggregated counters across all agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_agents: usize,
    pub by_status: HashMap<AgentStatus, usize>,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub average_duration_ms: f64,
    pub agents: Vec<AgentMetrics>,
}

/// Outcome of a best-effort bulk operation
#[derive(Debug, Default)]
pub struct BulkReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<(String, OrchestratorError)>,
}

impl BulkReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Entry {
    worker: Arc<Worker>,
    metadata: Map<String, Value>,
    registered_at: DateTime<Utc>,
    forwarder: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, Entry>,
    order: Vec<String>,
    by_tag: HashMap<String, HashSet<String>>,
    by_capability: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn index(&mut self, config: &AgentConfig) {
        for tag in &config.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(config.id.clone());
        }
        for capability in &config.capabilities {
            self.by_capability
                .entry(capability.name.clone())
                .or_default()
                .insert(config.id.clone());
        }
    }

    fn unindex(&mut self, id: &str) {
        for ids in self.by_tag.values_mut() {
            ids.remove(id);
        }
        for ids in self.by_capability.values_mut() {
            ids.remove(id);
        }
        self.by_tag.retain(|_, ids| !ids.is_empty());
        self.by_capability.retain(|_, ids| !ids.is_empty());
    }

    /// Ids present in every requested index, `None` when no index applies
    fn indexed_candidates(&self, query: &AgentQuery) -> Option<HashSet<String>> {
        let mut sets = query
            .tags
            .iter()
            .map(|t| self.by_tag.get(t))
            .chain(query.capabilities.iter().map(|c| self.by_capability.get(c)));

        let first = sets.next()?;
        let mut candidates = first.cloned().unwrap_or_default();
        for set in sets {
            match set {
                Some(ids) => candidates.retain(|id| ids.contains(id)),
                None => candidates.clear(),
            }
        }
        Some(candidates)
    }
}

/// Registry of agent workers
pub struct AgentRegistry {
    config: RegistryConfig,
    events: SharedEventBus,
    state: RwLock<RegistryState>,
    monitor: Mutex<Option<Ticker>>,
    this: Weak<AgentRegistry>,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, events: SharedEventBus) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            events,
            state: RwLock::new(RegistryState::default()),
            monitor: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// Register a worker and initialize it if it is still idle
    ///
    /// Fails with `DuplicateId`, leaving the registry unchanged, when the id is taken.
    #[instrument(skip(self, worker, metadata), fields(agent_id = %worker.id()))]
    pub async fn register(
        &self,
        worker: Arc<Worker>,
        metadata: Map<String, Value>,
    ) -> OrchestratorResult<()> {
        let id = worker.id().to_string();
        if self.state.read().agents.contains_key(&id) {
            return Err(OrchestratorError::DuplicateId(id));
        }

        if worker.status() == AgentStatus::Idle {
            worker.initialize().await?;
        }

        let config = worker.config();
        {
            let mut state = self.state.write();
            // Re-checked under the write lock: initialize() awaited in between
            if state.agents.contains_key(&id) {
                return Err(OrchestratorError::DuplicateId(id));
            }
            let forwarder = self.forward_events(&worker);
            state.index(&config);
            state.order.push(id.clone());
            state.agents.insert(
                id.clone(),
                Entry {
                    worker,
                    metadata,
                    registered_at: Utc::now(),
                    forwarder,
                },
            );
        }

        info!(
            agent_id = %id,
            tags = ?config.tags,
            capabilities = config.capabilities.len(),
            "Agent registered"
        );
        self.events.publish(
            Event::new(types::AGENT_REGISTERED)
                .with_agent(id)
                .with_data(json!({"name": config.name, "tags": config.tags})),
        );
        Ok(())
    }

    fn forward_events(&self, worker: &Arc<Worker>) -> Option<JoinHandle<()>> {
        if same_bus(worker.events(), &self.events) {
            return None;
        }
        let mut rx = worker.events().subscribe();
        let sink = Arc::clone(&self.events);
        let agent_id = worker.id().to_string();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.publish(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(agent_id = %agent_id, skipped, "Event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Remove an agent, then stop and shut it down
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: &str) -> OrchestratorResult<()> {
        let entry = {
            let mut state = self.state.write();
            let entry = state
                .agents
                .remove(id)
                .ok_or_else(|| OrchestratorError::not_found("agent", id))?;
            state.order.retain(|existing| existing != id);
            state.unindex(id);
            entry
        };

        let result = entry.worker.shutdown().await;
        if let Some(forwarder) = entry.forwarder {
            // let the shutdown events through before cutting the stream
            tokio::task::yield_now().await;
            forwarder.abort();
        }

        info!(agent_id = %id, "Agent unregistered");
        self.events.publish(Event::new(types::AGENT_UNREGISTERED).with_agent(id));
        result.map(|_| ())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.state
            .read()
            .agents
            .get(id)
            .map(|entry| Arc::clone(&entry.worker))
    }

    /// Look up an agent or fail with `AgentNotFound`
    pub fn require(&self, id: &str) -> OrchestratorResult<Arc<Worker>> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(id.to_string()))
    }

    pub fn describe(&self, id: &str) -> Option<RegisteredAgent> {
        self.state.read().agents.get(id).map(|entry| RegisteredAgent {
            worker: Arc::clone(&entry.worker),
            metadata: entry.metadata.clone(),
            registered_at: entry.registered_at,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All agents in registration order
    pub fn list(&self) -> Vec<Arc<Worker>> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.agents.get(id))
            .map(|entry| Arc::clone(&entry.worker))
            .collect()
    }

    /// Agents matching every criterion of `query`, in registration order
    pub fn find_agents(&self, query: &AgentQuery) -> Vec<Arc<Worker>> {
        let state = self.state.read();
        let candidates = state.indexed_candidates(query);
        state
            .order
            .iter()
            .filter(|id| candidates.as_ref().map_or(true, |c| c.contains(*id)))
            .filter_map(|id| state.agents.get(id))
            .filter(|entry| query.matches(&entry.worker))
            .map(|entry| Arc::clone(&entry.worker))
            .collect()
    }

    /// Ids indexed under `tag`, sorted
    pub fn agents_with_tag(&self, tag: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .read()
            .by_tag
            .get(tag)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Ids indexed under capability `name`, sorted
    pub fn agents_with_capability(&self, name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .read()
            .by_capability
            .get(name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Replace an agent's config and re-index it
    pub fn update_agent_config(&self, id: &str, config: AgentConfig) -> OrchestratorResult<()> {
        let worker = self.require(id)?;
        worker.update_config(config.clone())?;

        let mut state = self.state.write();
        if state.agents.contains_key(id) {
            state.unindex(id);
            state.index(&config);
        }
        debug!(agent_id = %id, "Agent re-indexed");
        Ok(())
    }

    pub async fn start_agent(&self, id: &str) -> OrchestratorResult<()> {
        self.require(id)?.start().await
    }

    pub async fn stop_agent(&self, id: &str) -> OrchestratorResult<()> {
        self.require(id)?.stop().await.map(|_| ())
    }

    /// Start every enabled agent; failures are collected, not fatal
    pub async fn start_all(&self) -> BulkReport {
        let mut report = BulkReport::default();
        for worker in self.list() {
            if !worker.config().enabled {
                debug!(agent_id = %worker.id(), "Skipping disabled agent");
                continue;
            }
            match worker.start().await {
                Ok(()) => report.succeeded.push(worker.id().to_string()),
                Err(err) => {
                    warn!(agent_id = %worker.id(), error = %err, "Agent failed to start");
                    report.failures.push((worker.id().to_string(), err));
                }
            }
        }
        report
    }

    /// Health of every agent; worst status wins
    pub async fn get_system_health(&self) -> SystemHealth {
        let workers = self.list();
        let reports =
            futures::future::join_all(workers.iter().map(|worker| worker.get_health())).await;
        SystemHealth::from_reports(reports)
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        let agents: Vec<AgentMetrics> = self.list().iter().map(|w| w.metrics()).collect();

        let mut metrics = SystemMetrics {
            total_agents: agents.len(),
            ..Default::default()
        };
        let mut total_duration_ms = 0u64;
        for agent in &agents {
            *metrics.by_status.entry(agent.status).or_insert(0) += 1;
            metrics.tasks_processed += agent.tasks_processed;
            metrics.tasks_successful += agent.tasks_successful;
            metrics.tasks_failed += agent.tasks_failed;
            total_duration_ms += agent.total_duration_ms;
        }
        if metrics.tasks_processed > 0 {
            metrics.average_duration_ms = total_duration_ms as f64 / metrics.tasks_processed as f64;
        }
        metrics.agents = agents;
        metrics
    }

    // ========================================================================
    // Heartbeat monitor
    // ========================================================================

    /// Start the periodic heartbeat check; a second call is ignored
    pub fn start_heartbeat_monitor(&self) {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return;
        }
        let weak = self.this.clone();
        *slot = Some(Ticker::spawn(
            "heartbeat-monitor",
            self.config.heartbeat_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.check_heartbeats();
                    }
                }
            },
        ));
        debug!(
            interval_ms = self.config.heartbeat_check_interval.as_millis() as u64,
            timeout_ms = self.config.effective_heartbeat_timeout().as_millis() as u64,
            "Heartbeat monitor started"
        );
    }

    /// Flag running agents whose heartbeat is overdue; returns the newly flagged ids
    pub fn check_heartbeats(&self) -> Vec<String> {
        let timeout = self.config.effective_heartbeat_timeout();
        let mut flagged = Vec::new();

        for worker in self.list() {
            if !worker.is_running() {
                continue;
            }
            let Some(elapsed) = worker.heartbeat_elapsed() else {
                continue;
            };
            if elapsed > timeout && worker.mark_heartbeat_timeout() {
                warn!(
                    agent_id = %worker.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    "Agent heartbeat timed out"
                );
                self.events.publish(
                    Event::new(types::AGENT_HEARTBEAT_TIMEOUT)
                        .with_agent(worker.id().to_string())
                        .with_severity(Severity::Warning)
                        .with_data(json!({
                            "elapsed_ms": elapsed.as_millis() as u64,
                            "timeout_ms": timeout.as_millis() as u64,
                            "last_heartbeat": worker.last_heartbeat(),
                        })),
                );
                flagged.push(worker.id().to_string());
            }
        }
        flagged
    }

    /// Stop the monitor and unregister every agent, best-effort
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> BulkReport {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let ids: Vec<String> = self.state.read().order.clone();
        let mut report = BulkReport::default();
        for id in ids {
            match self.unregister(&id).await {
                Ok(()) => report.succeeded.push(id),
                Err(err) => {
                    warn!(agent_id = %id, error = %err, "Agent cleanup failed");
                    report.failures.push((id, err));
                }
            }
        }

        {
            let mut state = self.state.write();
            state.by_tag.clear();
            state.by_capability.clear();
        }
        info!(
            unregistered = report.succeeded.len(),
            failed = report.failures.len(),
            "Registry cleaned up"
        );
        report
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.state.read().order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{FnAgent, WorkerConfig};
    use fleetflow_core::{BroadcastEventBus, Capability};

    fn worker(config: AgentConfig, bus: &SharedEventBus) -> Arc<Worker> {
        let agent = FnAgent::new(|_task| async { Ok(Value::Null) }).shared();
        Worker::new(
            config,
            WorkerConfig::default().with_memory_threshold_mb(None),
            agent,
            Arc::clone(bus),
        )
    }

    #[tokio::test]
    async fn test_duplicate_registration_leaves_registry_unchanged() {
        let bus = BroadcastEventBus::shared();
        let registry = AgentRegistry::new(RegistryConfig::default(), bus.clone());

        let first = worker(AgentConfig::new("writer", "Writer").with_tag("content"), &bus);
        registry.register(first, Map::new()).await.unwrap();
        assert!(registry.get("writer").unwrap().is_initialized());

        let second = worker(AgentConfig::new("writer", "Other").with_tag("ops"), &bus);
        let err = registry.register(second, Map::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateId(_)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("writer").unwrap().config().name, "Writer");
        assert!(registry.agents_with_tag("ops").is_empty());
    }

    #[tokio::test]
    async fn test_update_config_reindexes() {
        let bus = BroadcastEventBus::shared();
        let registry = AgentRegistry::new(RegistryConfig::default(), bus.clone());
        let config = AgentConfig::new("a", "A")
            .with_tag("old")
            .with_capability(Capability::new("draft"));
        registry.register(worker(config, &bus), Map::new()).await.unwrap();

        let updated = AgentConfig::new("a", "A")
            .with_tag("new")
            .with_capability(Capability::new("publish"));
        registry.update_agent_config("a", updated).unwrap();

        assert!(registry.agents_with_tag("old").is_empty());
        assert_eq!(registry.agents_with_tag("new"), vec!["a"]);
        assert_eq!(registry.agents_with_capability("publish"), vec!["a"]);
        assert!(registry.agents_with_capability("draft").is_empty());
    }

    #[test]
    fn test_default_heartbeat_timeout_is_three_intervals() {
        let config =
            RegistryConfig::default().with_heartbeat_check_interval(Duration::from_secs(2));
        assert_eq!(config.effective_heartbeat_timeout(), Duration::from_secs(6));
        let config = config.with_heartbeat_timeout(Duration::from_secs(1));
        assert_eq!(config.effective_heartbeat_timeout(), Duration::from_secs(1));
    }
}
