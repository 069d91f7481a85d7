//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sluice_connections_active` (gauge): current connection count
//! - `sluice_exchanges_total` (counter): completed exchanges by status
//! - `sluice_exchange_duration_seconds` (histogram): head parsed to completion
//! - `sluice_buffer_pool_live` (gauge): buffers checked out of the pool
//! - `sluice_upgrades_total` (counter): protocol switches by protocol
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - Status is the only exchange label, keeping cardinality bounded

use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must run inside a Tokio runtime; the exporter serves from a spawned task.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn connection_opened() {
    gauge!("sluice_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("sluice_connections_active").decrement(1.0);
}

/// Record a completed exchange.
pub fn record_exchange(status: StatusCode, elapsed: Duration) {
    counter!("sluice_exchanges_total", "status" => status.as_u16().to_string()).increment(1);
    histogram!("sluice_exchange_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_upgrade(protocol: &str) {
    counter!("sluice_upgrades_total", "protocol" => protocol.to_string()).increment(1);
}
