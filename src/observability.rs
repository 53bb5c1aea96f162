use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::engine::ErrorKind;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: action, status.
pub const REQUESTS_TOTAL: &str = "roomkeeper_requests_total";

/// Histogram: request latency in seconds. Labels: action.
pub const REQUEST_DURATION_SECONDS: &str = "roomkeeper_request_duration_seconds";

/// Counter: requests rejected by the engine. Labels: kind.
pub const REJECTIONS_TOTAL: &str = "roomkeeper_rejections_total";

// ── Record store gateway ────────────────────────────────────────

/// Counter: store calls. Labels: op, outcome.
pub const STORE_CALLS_TOTAL: &str = "roomkeeper_store_calls_total";

/// Histogram: store call latency in seconds, retries included. Labels: op.
pub const STORE_CALL_DURATION_SECONDS: &str = "roomkeeper_store_call_duration_seconds";

/// Counter: transient store failures that were retried. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "roomkeeper_store_retries_total";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: occurrences committed.
pub const OCCURRENCES_COMMITTED_TOTAL: &str = "roomkeeper_occurrences_committed_total";

/// Counter: compensating rollbacks. Labels: outcome (clean, orphaned).
pub const ROLLBACKS_TOTAL: &str = "roomkeeper_rollbacks_total";

// ── Briefing ────────────────────────────────────────────────────

/// Counter: briefing runs. Labels: outcome.
pub const BRIEFINGS_TOTAL: &str = "roomkeeper_briefings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomkeeper_connections_rejected_total";

/// Gauge: open notice subscriptions.
pub const LISTENERS_ACTIVE: &str = "roomkeeper_listeners_active";

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match cfg.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Metric label for a rejection.
pub fn rejection_label(kind: ErrorKind) -> &'static str {
    kind.as_str()
}
