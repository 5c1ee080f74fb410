// src/core/metrics.rs

//! Defines and registers Prometheus metrics for gateway monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Gauge, IntCounter, IntCounterVec, TextEncoder, register_gauge, register_int_counter,
    register_int_counter_vec,
};

lazy_static! {
    /// The number of client sessions currently open.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("respgate_connected_clients", "Number of currently connected clients.").unwrap();
    /// The number of tenants in the active credential snapshot.
    pub static ref CREDENTIALS_LOADED: Gauge =
        register_gauge!("respgate_credentials_loaded", "Number of tenant secrets in the active credential snapshot.").unwrap();

    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: IntCounter =
        register_int_counter!("respgate_connections_received_total", "Total number of connections received.").unwrap();
    /// The total number of connections turned away because `max_clients` was reached.
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter =
        register_int_counter!("respgate_connections_rejected_total", "Total number of connections rejected at the client limit.").unwrap();
    /// The total number of failed attempts to reach the upstream.
    pub static ref UPSTREAM_DIAL_FAILURES_TOTAL: IntCounter =
        register_int_counter!("respgate_upstream_dial_failures_total", "Total number of failed upstream dials.").unwrap();
    /// Handshake results, labeled by outcome.
    pub static ref HANDSHAKES_TOTAL: IntCounterVec =
        register_int_counter_vec!("respgate_handshakes_total", "Total number of completed or failed handshakes, labeled by outcome.", &["outcome"]).unwrap();
    /// Bytes relayed after the handshake, labeled by direction.
    pub static ref RELAYED_BYTES_TOTAL: IntCounterVec =
        register_int_counter_vec!("respgate_relayed_bytes_total", "Total number of bytes relayed, labeled by direction.", &["direction"]).unwrap();
    /// Credential reload attempts, labeled by result.
    pub static ref CREDENTIAL_RELOADS_TOTAL: IntCounterVec =
        register_int_counter_vec!("respgate_credential_reloads_total", "Total number of credential reloads, labeled by result.", &["result"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
