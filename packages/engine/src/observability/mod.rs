// packages/engine/src/observability/mod.rs
//! Tracing and metrics
//!
//! Metrics emitted by the engine:
//!
//! - `tpp_jobs_total{kind, outcome}`: finished jobs
//! - `tpp_job_duration_seconds{kind}`: wall time from setup to teardown
//! - `tpp_workspaces_reaped_total`: workspaces removed by the reaper
//!
//! Without an installed recorder the `metrics` macros are no-ops, so the
//! record functions are safe to call from tests.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Noisy dependencies kept at warn regardless of the base level
const QUIET_TARGETS: &[&str] = &["tokio_util=warn", "metrics_exporter_prometheus=warn"];

fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = std::iter::once(level)
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",");

    EnvFilter::try_new(&directives).map_err(|e| {
        EngineError::ConfigError(format!("Invalid tracing filter '{}': {}", directives, e))
    })
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(&config.level)?;

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| EngineError::RuntimeError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus exporter when enabled. Must run inside a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| EngineError::RuntimeError(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Metrics exporter listening on {}", config.listen);
    Ok(())
}

/// Record a finished job
pub fn record_job(kind: &'static str, outcome: &'static str, duration: Duration) {
    counter!("tpp_jobs_total", "kind" => kind, "outcome" => outcome).increment(1);
    histogram!("tpp_job_duration_seconds", "kind" => kind).record(duration.as_secs_f64());
}

pub fn record_workspace_reaped() {
    counter!("tpp_workspaces_reaped_total").increment(1);
}
