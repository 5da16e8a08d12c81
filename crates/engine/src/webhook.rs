//! Outbound calls for webhook steps

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetflow_core::{codes, AgentError, OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound webhook call, built from an interpolated step config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl WebhookRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Read `url`, `method`, `headers`, `body` (or `payload`) and `timeout_ms`
    pub fn from_step_config(config: &Map<String, Value>) -> OrchestratorResult<Self> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| OrchestratorError::validation("webhook step requires a url"))?;

        let mut request = Self::post(url);
        if let Some(method) = config.get("method").and_then(Value::as_str) {
            request.method = method.to_uppercase();
        }
        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request.headers.insert(name.clone(), value);
            }
        }
        request.body = config
            .get("body")
            .or_else(|| config.get("payload"))
            .cloned();
        if let Some(ms) = config.get("timeout_ms").and_then(Value::as_u64) {
            request.timeout = Duration::from_millis(ms);
        }
        Ok(request)
    }
}

/// Performs webhook calls; the response body becomes the step result
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn call(&self, request: &WebhookRequest) -> Result<Value, AgentError>;
}

/// reqwest-backed client
#[derive(Debug, Clone, Default)]
pub struct HttpWebhookClient {
    http: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn webhook_error(message: String, retryable: bool) -> AgentError {
    AgentError::new(codes::WEBHOOK_FAILED, message).with_retryable(retryable)
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn call(&self, request: &WebhookRequest) -> Result<Value, AgentError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            AgentError::new(
                codes::VALIDATION_ERROR,
                format!("invalid webhook method {}", request.method),
            )
        })?;

        let mut builder = self
            .http
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::timeout(format!("webhook {} timed out", request.url))
            } else {
                webhook_error(format!("webhook {} unreachable: {e}", request.url), true)
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| webhook_error(format!("failed to read webhook response: {e}"), true))?;

        debug!(url = %request.url, status = status.as_u16(), "Webhook responded");

        if !status.is_success() {
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(webhook_error(
                format!("webhook {} returned {}: {}", request.url, status, text),
                retryable,
            )
            .with_details(serde_json::json!({"status": status.as_u16()})));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
