//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ext_proc_events_total` (counter): events received, by kind
//! - `ext_proc_header_mutations_total` (counter): non-empty mutations sent, by kind
//! - `ext_proc_directive_errors_total` (counter): malformed directives
//! - `ext_proc_streams_total` (counter): finished streams, by outcome
//! - `ext_proc_active_streams` (gauge): streams currently open
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Prometheus scrape endpoint served by the exporter's own listener

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::processor::EventKind;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_event(kind: EventKind) {
    metrics::counter!("ext_proc_events_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_header_mutation(kind: EventKind) {
    metrics::counter!("ext_proc_header_mutations_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_directive_error() {
    metrics::counter!("ext_proc_directive_errors_total").increment(1);
}

pub fn stream_opened() {
    metrics::gauge!("ext_proc_active_streams").increment(1.0);
}

pub fn stream_closed(outcome: &'static str) {
    metrics::gauge!("ext_proc_active_streams").decrement(1.0);
    metrics::counter!("ext_proc_streams_total", "outcome" => outcome).increment(1);
}
