// src/observability/mod.rs
//! Tracing and metrics initialization

use crate::utils::errors::{Result, SandboxError};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` controls the
/// filter; defaults to `info`.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| SandboxError::Config(format!("failed to init tracing: {e}")))
}

/// Install the Prometheus recorder and register metric descriptions.
/// The returned handle renders the scrape page for `GET /metrics`.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SandboxError::Config(format!("failed to init metrics: {e}")))?;

    describe_counter!(
        "sandbox_executions_total",
        "Sandbox executions by language and outcome"
    );
    describe_histogram!(
        "sandbox_execution_duration_seconds",
        "End-to-end execution latency by language"
    );

    Ok(handle)
}
