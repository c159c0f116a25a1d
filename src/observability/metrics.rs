//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rotator_attempts_total` (counter): attempts by provider, status, reason
//! - `rotator_idempotent_hits_total` (counter): duplicate rotations absorbed
//! - `rotator_breaker_transitions_total` (counter): by provider, target state
//! - `rotator_alerts_total` (counter): by severity, outcome
//! - `rotator_chaos_runs_total` (counter): by scenario, verdict
//! - `rotator_attempt_duration_seconds` (histogram): end-to-end attempt latency
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Idempotent hits are a separate counter so success/failure rates only
//!   count new work

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_attempt(provider: &str, status: &'static str, reason: &'static str) {
    metrics::counter!(
        "rotator_attempts_total",
        "provider" => provider.to_string(),
        "status" => status,
        "reason" => reason
    )
    .increment(1);
}

pub fn record_idempotent_hit(provider: &str) {
    metrics::counter!("rotator_idempotent_hits_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_breaker_transition(provider: &str, to: &'static str) {
    metrics::counter!(
        "rotator_breaker_transitions_total",
        "provider" => provider.to_string(),
        "to" => to
    )
    .increment(1);
}

pub fn record_alert(severity: &'static str, outcome: &'static str) {
    metrics::counter!("rotator_alerts_total", "severity" => severity, "outcome" => outcome).increment(1);
}

pub fn record_chaos_run(scenario: &str, status: &'static str) {
    metrics::counter!(
        "rotator_chaos_runs_total",
        "scenario" => scenario.to_string(),
        "status" => status
    )
    .increment(1);
}

pub fn record_attempt_duration(provider: &str, started: Instant) {
    metrics::histogram!(
        "rotator_attempt_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(started.elapsed().as_secs_f64());
}
