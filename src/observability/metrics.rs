//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define resilience metrics (breaker state, rejections, rate limit hits)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `circuit_breaker_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `circuit_breaker_transitions_total` (counter): by circuit, from, to
//! - `circuit_breaker_failures_total` (counter): failed protected calls
//! - `circuit_breaker_rejections_total` (counter): calls failed fast
//! - `rate_limit_rejections_total` (counter): by limiter prefix and algorithm
//! - `airtable_rate_limit_hits_total` (counter): by base and limit type
//! - `airtable_rate_limit_remaining` (gauge): remaining quota per base
//! - `http_client_requests_total` (counter): by service, method, outcome
//! - `http_client_request_duration_seconds` (histogram): upstream latency
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; it is a no-op until a
//!   recorder is installed, so the core never depends on the sink
//! - Label values are owned strings; names are dynamic breaker names

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a breaker state transition and the new state gauge.
pub fn record_state_transition(circuit: &str, from: &'static str, to: &'static str, state_value: u8) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "circuit_name" => circuit.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
    metrics::gauge!("circuit_breaker_state", "circuit_name" => circuit.to_string())
        .set(f64::from(state_value));
}

pub fn record_breaker_failure(circuit: &str) {
    metrics::counter!("circuit_breaker_failures_total", "circuit_name" => circuit.to_string())
        .increment(1);
}

pub fn record_breaker_rejection(circuit: &str) {
    metrics::counter!("circuit_breaker_rejections_total", "circuit_name" => circuit.to_string())
        .increment(1);
}

pub fn record_rate_limited(limiter: &str, algorithm: &'static str) {
    metrics::counter!(
        "rate_limit_rejections_total",
        "limiter" => limiter.to_string(),
        "algorithm" => algorithm
    )
    .increment(1);
}

pub fn record_airtable_limit_hit(base_id: &str, limit_type: &'static str) {
    metrics::counter!(
        "airtable_rate_limit_hits_total",
        "base_id" => base_id.to_string(),
        "limit_type" => limit_type
    )
    .increment(1);
}

pub fn record_airtable_remaining(base_id: &str, remaining: u64) {
    metrics::gauge!("airtable_rate_limit_remaining", "base_id" => base_id.to_string())
        .set(remaining as f64);
}

/// Record one outbound request made by a resilient client.
pub fn record_client_request(service: &str, method: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!(
        "http_client_requests_total",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "http_client_request_duration_seconds",
        "service" => service.to_string()
    )
    .record(elapsed.as_secs_f64());
}
