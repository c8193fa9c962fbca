//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_requests_total` (counter): finished requests by transport, status
//! - `engine_request_duration_seconds` (histogram): accept to last flush
//! - `engine_filtered_total` (counter): requests answered by a filter, by kind
//! - `engine_handler_failures_total` (counter): handler errors and panics
//! - `engine_queue_rejections_total` (counter): requests refused at the job queue
//! - `engine_sessions_active` (gauge): sessions currently in the store
//! - `engine_sessions_evicted_total` (counter): sessions removed by the sweeper
//!
//! # Design Decisions
//! - Call sites use the functions below, never the macros directly
//! - Without an installed recorder every call is a no-op
//! - The Prometheus exporter is optional and owns its own listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(transport: &'static str, status: u16, started: Instant) {
    counter!(
        "engine_requests_total",
        "transport" => transport,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("engine_request_duration_seconds", "transport" => transport)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_filtered(kind: &'static str) {
    counter!("engine_filtered_total", "kind" => kind).increment(1);
}

pub fn record_handler_failure(reason: &'static str) {
    counter!("engine_handler_failures_total", "reason" => reason).increment(1);
}

pub fn record_queue_rejection(reason: &'static str) {
    counter!("engine_queue_rejections_total", "reason" => reason).increment(1);
}

pub fn set_sessions_active(count: usize) {
    gauge!("engine_sessions_active").set(count as f64);
}

pub fn record_sessions_evicted(count: usize) {
    counter!("engine_sessions_evicted_total").increment(count as u64);
}
