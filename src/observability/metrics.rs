//! Metrics collection and exposition.
//!
//! # Metrics
//! - `owin_bridge_requests_total` (counter): requests by outcome and status
//! - `owin_bridge_request_duration_seconds` (histogram): time spent in the bridge
//! - `owin_bridge_initializations_total` (counter): pipeline initializations by result
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   embedders that skip `init_metrics` pay nothing
//! - Outcome labels are `complete`, `continue` and `error`

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_request(outcome: &'static str, status: u16, start: Instant) {
    counter!(
        "owin_bridge_requests_total",
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("owin_bridge_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_initialization(result: &'static str) {
    counter!("owin_bridge_initializations_total", "result" => result).increment(1);
}
