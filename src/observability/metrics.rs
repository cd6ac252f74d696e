//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sslstrip_requests_total` (counter): proxied requests by upstream scheme and status
//! - `sslstrip_upstream_failures_total` (counter): requests answered with 502
//! - `sslstrip_downgrade_entries_total` (counter): new downgrade table keys
//! - `sslstrip_links_rewritten_total` (counter): secure links rewritten in HTML
//! - `sslstrip_tunnels_total` (counter): CONNECT tunnels by outcome
//! - `sslstrip_active_connections` (gauge): live client connections by kind

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(scheme: &'static str, status: u16) {
    counter!("sslstrip_requests_total", "scheme" => scheme, "status" => status.to_string())
        .increment(1);
}

pub fn record_upstream_failure() {
    counter!("sslstrip_upstream_failures_total").increment(1);
}

pub fn record_downgrade_entry() {
    counter!("sslstrip_downgrade_entries_total").increment(1);
}

pub fn record_links_rewritten(count: usize) {
    counter!("sslstrip_links_rewritten_total").increment(count as u64);
}

/// `outcome` is one of `established`, `connect_failed` or `relay_failed`.
pub fn record_tunnel(outcome: &'static str) {
    counter!("sslstrip_tunnels_total", "outcome" => outcome).increment(1);
}

pub fn set_active_connections(kind: &'static str, active: u64) {
    gauge!("sslstrip_active_connections", "kind" => kind).set(active as f64);
}
