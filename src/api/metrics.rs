//! Prometheus metrics endpoint and recording helpers.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

use crate::AppState;

pub const RESTARTS_TOTAL: &str = "mendr_restarts_total";
pub const RESTART_FAILURES_TOTAL: &str = "mendr_restart_failures_total";
pub const EVENTS_TOTAL: &str = "mendr_events_total";
pub const CONTAINERS_TOTAL: &str = "mendr_containers_total";
pub const CONTAINERS_MONITORED: &str = "mendr_containers_monitored";
pub const CONTAINERS_QUARANTINED: &str = "mendr_containers_quarantined";
pub const RUNTIME_AVAILABLE: &str = "mendr_runtime_available";
pub const TICK_DURATION_SECONDS: &str = "mendr_monitor_tick_duration_seconds";

/// Install the Prometheus recorder. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    describe_counter!(
        RESTARTS_TOTAL,
        "Successful automatic restarts (labeled by container)"
    );
    describe_counter!(
        RESTART_FAILURES_TOTAL,
        "Failed restart attempts (labeled by container)"
    );
    describe_counter!(EVENTS_TOTAL, "Engine events by kind and status");
    describe_gauge!(CONTAINERS_TOTAL, "Containers seen in the last pass");
    describe_gauge!(CONTAINERS_MONITORED, "Containers in the monitored set");
    describe_gauge!(CONTAINERS_QUARANTINED, "Stable ids currently quarantined");
    describe_gauge!(
        RUNTIME_AVAILABLE,
        "Container runtime reachability (1 reachable, 0 not)"
    );
    describe_histogram!(TICK_DURATION_SECONDS, "Monitoring pass duration in seconds");

    handle
}

/// GET /metrics - Prometheus text format.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Refresh gauges that have a cheap source of truth before rendering.
    gauge!(CONTAINERS_QUARANTINED).set(state.store.quarantined().len() as f64);
    gauge!(RUNTIME_AVAILABLE).set(if state.health.runtime_ok() { 1.0 } else { 0.0 });

    match state.metrics_handle.as_ref() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

pub fn increment_restarts(container: &str) {
    counter!(RESTARTS_TOTAL, "container" => container.to_string()).increment(1);
}

pub fn increment_restart_failures(container: &str) {
    counter!(RESTART_FAILURES_TOTAL, "container" => container.to_string()).increment(1);
}

pub fn record_event(kind: &str, status: &str) {
    counter!(EVENTS_TOTAL, "kind" => kind.to_string(), "status" => status.to_string()).increment(1);
}

pub fn record_tick_duration(duration_secs: f64) {
    histogram!(TICK_DURATION_SECONDS).record(duration_secs);
}

pub fn set_runtime_available(available: bool) {
    gauge!(RUNTIME_AVAILABLE).set(if available { 1.0 } else { 0.0 });
}

pub fn set_container_counts(total: usize, monitored: usize, quarantined: usize) {
    gauge!(CONTAINERS_TOTAL).set(total as f64);
    gauge!(CONTAINERS_MONITORED).set(monitored as f64);
    gauge!(CONTAINERS_QUARANTINED).set(quarantined as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_naming_conventions() {
        assert!(RESTARTS_TOTAL.ends_with("_total"));
        assert!(RESTART_FAILURES_TOTAL.ends_with("_total"));
        assert!(EVENTS_TOTAL.ends_with("_total"));
        assert!(TICK_DURATION_SECONDS.ends_with("_seconds"));
    }
}
