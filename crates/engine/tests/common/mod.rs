//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetflow_core::{
    codes, AgentConfig, AgentError, AgentTask, BroadcastEventBus, Event, SharedEventBus,
};
use fleetflow_engine::engine::EngineConfig;
use fleetflow_engine::{
    AgentRegistry, FnAgent, InMemoryExecutionStore, RegistryConfig, SharedAgent, WebhookClient,
    Worker, WorkerConfig, WorkflowEngine,
};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

pub struct Harness {
    pub events: SharedEventBus,
    pub registry: Arc<AgentRegistry>,
    pub engine: WorkflowEngine,
    pub store: Arc<InMemoryExecutionStore>,
}

impl Harness {
    pub async fn new(config: EngineConfig) -> Self {
        Self::build(config, None).await
    }

    pub async fn with_webhook(config: EngineConfig, client: Arc<dyn WebhookClient>) -> Self {
        Self::build(config, Some(client)).await
    }

    async fn build(config: EngineConfig, webhook: Option<Arc<dyn WebhookClient>>) -> Self {
        let events = BroadcastEventBus::shared();
        let registry = AgentRegistry::new(RegistryConfig::default(), events.clone());
        let store = Arc::new(InMemoryExecutionStore::new());

        let mut builder = WorkflowEngine::builder(registry.clone())
            .config(config)
            .store(store.clone());
        if let Some(client) = webhook {
            builder = builder.webhook_client(client);
        }
        let engine = builder.build();
        engine.start().await.unwrap();

        let harness = Self {
            events,
            registry,
            engine,
            store,
        };
        harness.add_agent("echo", echo(), 8).await;
        harness
    }

    /// Register and start an agent
    pub async fn add_agent(&self, id: &str, agent: SharedAgent, max_concurrency: usize) {
        let worker = Worker::new(
            AgentConfig::new(id, id).with_max_concurrency(max_concurrency),
            WorkerConfig::default().with_memory_threshold_mb(None),
            agent,
            self.events.clone(),
        );
        self.registry.register(worker, Map::new()).await.unwrap();
        self.registry.start_agent(id).await.unwrap();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

/// Event types received so far, in publish order
pub fn drain_types(rx: &mut broadcast::Receiver<Event>, prefix: &str) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.event_type.starts_with(prefix) {
            types.push(event.event_type);
        }
    }
    types
}

pub fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Returns its payload
pub fn echo() -> SharedAgent {
    FnAgent::new(|task: AgentTask| async move { Ok(Value::Object(task.payload)) }).shared()
}

/// Always fails with a plain execution error, counting calls
pub fn failing(calls: Arc<AtomicU32>) -> SharedAgent {
    failing_with(calls, codes::EXECUTION_FAILED)
}

/// Always fails with `code`, counting calls
pub fn failing_with(calls: Arc<AtomicU32>, code: &'static str) -> SharedAgent {
    FnAgent::new(move |task: AgentTask| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::new(code, format!("{} always fails", task.agent_id)))
        }
    })
    .shared()
}

/// Sleeps, then reports how long
pub fn sleepy(duration: Duration) -> SharedAgent {
    FnAgent::new(move |_task: AgentTask| async move {
        tokio::time::sleep(duration).await;
        Ok(json!({"slept_ms": duration.as_millis() as u64}))
    })
    .shared()
}

/// Tracks how many calls run at the same time
#[derive(Default)]
pub struct Gauge {
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
}

pub fn gauged(gauge: Arc<Gauge>, duration: Duration) -> SharedAgent {
    FnAgent::new(move |_task: AgentTask| {
        let gauge = gauge.clone();
        async move {
            let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            gauge.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    })
    .shared()
}
