//! Lightweight metrics helpers for hopgate.
//!
//! Thin functions over the `metrics` crate macros. No exporter is installed
//! here; the embedding application may install any compatible recorder, and
//! without one every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `hopgate_connections_total` (counter, by service)
//! * `hopgate_active_connections` (gauge, by service)
//! * `hopgate_connection_duration_seconds` (histogram, by service)
//! * `hopgate_routes_total` (counter, by chain and result)
//! * `hopgate_route_dial_duration_seconds` (histogram, by chain)
//! * `hopgate_node_failures_total` (counter, by node and error kind)
//! * `hopgate_node_health_status` (gauge per node)
//! * `hopgate_relayed_bytes_total` (counter, by direction)
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const HOPGATE_CONNECTIONS_TOTAL: &str = "hopgate_connections_total";
pub const HOPGATE_ACTIVE_CONNECTIONS: &str = "hopgate_active_connections";
pub const HOPGATE_CONNECTION_DURATION_SECONDS: &str = "hopgate_connection_duration_seconds";
pub const HOPGATE_ROUTES_TOTAL: &str = "hopgate_routes_total"; // labels: chain, result
pub const HOPGATE_ROUTE_DIAL_DURATION_SECONDS: &str = "hopgate_route_dial_duration_seconds";
pub const HOPGATE_NODE_FAILURES_TOTAL: &str = "hopgate_node_failures_total"; // labels: node, kind
pub const HOPGATE_NODE_HEALTH_STATUS: &str = "hopgate_node_health_status";
pub const HOPGATE_RELAYED_BYTES_TOTAL: &str = "hopgate_relayed_bytes_total"; // labels: direction

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        HOPGATE_CONNECTIONS_TOTAL,
        Unit::Count,
        "Total number of inbound connections accepted."
    );
    describe_gauge!(
        HOPGATE_ACTIVE_CONNECTIONS,
        "Number of inbound connections currently being forwarded."
    );
    describe_histogram!(
        HOPGATE_CONNECTION_DURATION_SECONDS,
        Unit::Seconds,
        "Lifetime of forwarded connections."
    );
    describe_counter!(
        HOPGATE_ROUTES_TOTAL,
        Unit::Count,
        "Route build attempts by chain and result."
    );
    describe_histogram!(
        HOPGATE_ROUTE_DIAL_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent establishing a route."
    );
    describe_counter!(
        HOPGATE_NODE_FAILURES_TOTAL,
        Unit::Count,
        "Failed node attempts by node and error kind."
    );
    describe_gauge!(
        HOPGATE_NODE_HEALTH_STATUS,
        "Health of individual nodes (1 for ok, 0 for marked failed)"
    );
    describe_counter!(
        HOPGATE_RELAYED_BYTES_TOTAL,
        Unit::Bytes,
        "Bytes relayed by direction."
    );
});

/// Set the health status gauge for a node.
pub fn set_node_health_status(node: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };
    gauge!(HOPGATE_NODE_HEALTH_STATUS, "node" => node.to_string()).set(health_value);
}

pub fn record_route_established(chain: &str, nodes: usize, duration: std::time::Duration) {
    counter!(HOPGATE_ROUTES_TOTAL, "chain" => chain.to_string(), "result" => "ok").increment(1);
    histogram!(
        HOPGATE_ROUTE_DIAL_DURATION_SECONDS,
        "chain" => chain.to_string(),
        "nodes" => nodes.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_route_failure(chain: &str, kind: &'static str) {
    counter!(HOPGATE_ROUTES_TOTAL, "chain" => chain.to_string(), "result" => kind).increment(1);
}

pub fn record_node_failure(node: &str, kind: &'static str) {
    counter!(HOPGATE_NODE_FAILURES_TOTAL, "node" => node.to_string(), "kind" => kind).increment(1);
}

pub fn record_relayed_bytes(direction: &'static str, bytes: u64) {
    counter!(HOPGATE_RELAYED_BYTES_TOTAL, "direction" => direction).increment(bytes);
}

/// RAII helper counting an inbound connection for its whole lifetime.
pub struct ConnectionTimer {
    start: Instant,
    service: String,
}

impl ConnectionTimer {
    pub fn new(service: &str) -> Self {
        counter!(HOPGATE_CONNECTIONS_TOTAL, "service" => service.to_string()).increment(1);
        gauge!(HOPGATE_ACTIVE_CONNECTIONS, "service" => service.to_string()).increment(1.0);
        Self {
            start: Instant::now(),
            service: service.to_string(),
        }
    }
}

impl Drop for ConnectionTimer {
    fn drop(&mut self) {
        gauge!(HOPGATE_ACTIVE_CONNECTIONS, "service" => self.service.clone()).decrement(1.0);
        histogram!(HOPGATE_CONNECTION_DURATION_SECONDS, "service" => self.service.clone())
            .record(self.start.elapsed().as_secs_f64());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
    tracing::debug!("hopgate metrics described");
}
