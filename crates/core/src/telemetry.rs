// Telemetry Module
//
// Initialization helpers for tracing-based logging. Logs go to stdout as
// human-readable text or JSON lines; the filter comes from the environment.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Telemetry Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "fleetflow_engine=debug")
    pub log_filter: Option<String>,
    pub format: LogFormat,
    /// Include the module target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "fleetflow".to_string(),
            log_filter: None,
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLEETFLOW_SERVICE_NAME`: Service name (default: "fleetflow")
    /// - `FLEETFLOW_LOG`, `RUST_LOG` or `LOG_LEVEL`: Log filter, first one set wins
    /// - `FLEETFLOW_LOG_FORMAT`: "json" for JSON lines, anything else for text
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("FLEETFLOW_SERVICE_NAME")
                .unwrap_or_else(|_| "fleetflow".to_string()),
            log_filter: std::env::var("FLEETFLOW_LOG")
                .ok()
                .or_else(|| std::env::var("RUST_LOG").ok())
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: match std::env::var("FLEETFLOW_LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            with_target: true,
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global tracing subscriber
///
/// Returns false if a subscriber was already installed (tests and embedding
/// applications may have done so); the existing one is kept.
///
/// # Example
///
/// ```ignore
/// use fleetflow_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let filter = config.env_filter();

    let layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
    };

    let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, format = ?config.format, "Telemetry initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_filter_defaults_to_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.env_filter().to_string(), "info");
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let config = TelemetryConfig::default().with_log_filter("warn");
        let _ = init_telemetry(config.clone());
        assert!(!init_telemetry(config));
    }
}
