// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logs always go to stderr: the daemon's stdout carries protocol traffic.

use anyhow::Context;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

/// Gauge: live sessions in the pool
pub const SESSIONS: &str = "kernel_pool_sessions";

/// Counter: kernels started successfully
pub const STARTED_TOTAL: &str = "kernel_pool_started_total";

/// Counter: sessions torn down by the pool, labelled by `reason`
pub const EVICTED_TOTAL: &str = "kernel_pool_evicted_total";

/// Counter: completed `run` calls
pub const EXECUTIONS_TOTAL: &str = "kernel_pool_executions_total";

/// Counter: kernels that failed to start
pub const START_FAILURES_TOTAL: &str = "kernel_pool_start_failures_total";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };

    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// Serve Prometheus metrics on `addr`
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics exporter on {}", addr))?;

    metrics::describe_gauge!(SESSIONS, "Live kernel sessions");
    metrics::describe_counter!(STARTED_TOTAL, "Kernels started");
    metrics::describe_counter!(EVICTED_TOTAL, "Sessions reclaimed by the pool");
    metrics::describe_counter!(EXECUTIONS_TOTAL, "Code executions");
    metrics::describe_counter!(START_FAILURES_TOTAL, "Kernel start failures");

    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}
