mod metrics;

pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log output encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive equivalent to this config, e.g. `info,relay_store=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle kept by the process for the lifetime of telemetry.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// Per-module overrides the subscriber was built with.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize tracing and the metrics recorder. Call once at startup; a second
/// call keeps the first subscriber and only returns a fresh guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed(),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("relay-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        module_levels: Arc::new(RwLock::new(config.module_levels)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("relay_store".into(), Level::DEBUG)],
            format: LogFormat::Pretty,
        };
        assert_eq!(config.filter_directive(), "warn,relay_store=debug");
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        first.metrics().counter_inc("x", &[], 1);
        assert_eq!(second.metrics().counter_get("x", &[]), 0);
    }
}
