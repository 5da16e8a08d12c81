// Built-in demo agents
//
// Enough behavior to exercise every engine path from a manifest: success,
// permanent failure, transient failure and slow work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetflow_core::{AgentError, AgentTask};
use fleetflow_engine::{FnAgent, SharedAgent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoKind {
    /// Returns its payload
    Echo,
    /// Always fails (`message`)
    Fail,
    /// Fails retryably for the first `failures` calls, then echoes
    Flaky,
    /// Sleeps `duration_ms` (payload overrides options), then reports it
    Sleep,
}

fn option_u64(options: &Map<String, Value>, key: &str, default: u64) -> u64 {
    options.get(key).and_then(Value::as_u64).unwrap_or(default)
}

pub fn build(kind: DemoKind, options: &Map<String, Value>) -> SharedAgent {
    match kind {
        DemoKind::Echo => {
            FnAgent::new(|task: AgentTask| async move { Ok(Value::Object(task.payload)) }).shared()
        }
        DemoKind::Fail => {
            let message = options
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("demo failure")
                .to_string();
            FnAgent::new(move |task: AgentTask| {
                let message = format!("{}: {message}", task.agent_id);
                async move { Err(AgentError::new("DEMO_FAILURE", message)) }
            })
            .shared()
        }
        DemoKind::Flaky => {
            let failures = option_u64(options, "failures", 1);
            let calls = Arc::new(AtomicU64::new(0));
            FnAgent::new(move |task: AgentTask| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call <= failures {
                        Err(AgentError::retryable(format!(
                            "{} transient failure {call}/{failures}",
                            task.agent_id
                        )))
                    } else {
                        Ok(Value::Object(task.payload))
                    }
                }
            })
            .shared()
        }
        DemoKind::Sleep => {
            let default_ms = option_u64(options, "duration_ms", 100);
            FnAgent::new(move |task: AgentTask| async move {
                let ms = task
                    .payload
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(default_ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            })
            .shared()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_core::TaskKind;
    use fleetflow_engine::worker::TaskExecutor;

    fn task(payload: Value) -> AgentTask {
        AgentTask::new(
            "demo",
            TaskKind::from("demo"),
            payload.as_object().cloned().unwrap_or_default(),
        )
    }

    #[tokio::test]
    async fn test_flaky_recovers_after_configured_failures() {
        let options = json!({"failures": 2}).as_object().cloned().unwrap();
        let agent = build(DemoKind::Flaky, &options);

        for _ in 0..2 {
            let err = agent.execute(&task(json!({}))).await.unwrap_err();
            assert!(err.retryable);
        }
        let result = agent.execute(&task(json!({"ok": true}))).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_fail_is_permanent() {
        let agent = build(DemoKind::Fail, &Map::new());
        let err = agent.execute(&task(json!({}))).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("demo failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_payload_overrides_option() {
        let options = json!({"duration_ms": 5000}).as_object().cloned().unwrap();
        let agent = build(DemoKind::Sleep, &options);
        let result = agent.execute(&task(json!({"duration_ms": 20}))).await.unwrap();
        assert_eq!(result, json!({"slept_ms": 20}));
    }
}
