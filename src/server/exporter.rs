//! Prometheus exporter and counter descriptions

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::types::{GatewayError, Result};

/// Counters emitted by the pipeline, with their help text
pub const COUNTERS: &[(&str, &str)] = &[
    ("request_call_total", "Requests entering the auth layer"),
    ("request_served_total", "Responses delivered without a sentry block"),
    ("request_blocked_total", "Responses blocked by a sentry rule"),
    ("request_log_total", "Usage reports attempted"),
    ("request_log_err_total", "Usage reports that failed"),
    ("ingress_bytes", "Billed ingress bytes"),
    ("egress_bytes", "Billed egress bytes"),
    ("dag_store_get_call_total", "Block fetches from the storage node"),
    ("dag_store_get_err_total", "Failed block fetches"),
    ("rc_pinner_pin_call_total", "Pin index pin calls"),
    ("rc_pinner_pin_err_total", "Pin index pin errors"),
    ("rc_pinner_unpin_call_total", "Pin index unpin calls"),
    ("rc_pinner_unpin_err_total", "Pin index unpin errors"),
    ("rc_pinner_get_count_call_total", "Pin index count calls"),
    ("rc_pinner_get_count_err_total", "Pin index count errors"),
    ("rc_pinner_update_counts_call_total", "Pin index batch update calls"),
    ("rc_pinner_update_counts_err_total", "Pin index batch update errors"),
    ("rc_pinner_recursive_keys_call_total", "Recursive pin listings"),
    ("rc_pinner_direct_keys_call_total", "Direct pin listings"),
];

pub fn describe() {
    for (name, help) in COUNTERS {
        metrics::describe_counter!(*name, *help);
    }
}

/// Install the global recorder and serve `/metrics` on `listen`
pub fn install(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| GatewayError::Config(format!("metrics exporter: {e}")))?;
    describe();
    info!(listen = %listen, "Prometheus exporter enabled");
    Ok(())
}
