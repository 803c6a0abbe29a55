//! Event records and the sink seam.
//!
//! Everything user-visible that the engine does becomes an `EventRecord`:
//! restarts, quarantine transitions, auto-enrollment, detected failures and
//! degraded-mode errors. The `EventSink` trait is the single capability the
//! core exposes for shipping those records elsewhere; the durable ring, the
//! log and the metrics exporter are interchangeable consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Restart,
    Quarantine,
    Unquarantine,
    HealthCheckFailed,
    AutoMonitor,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Restart => "restart",
            EventKind::Quarantine => "quarantine",
            EventKind::Unquarantine => "unquarantine",
            EventKind::HealthCheckFailed => "health_check_failed",
            EventKind::AutoMonitor => "auto_monitor",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failure,
    Quarantined,
    Enabled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
            EventStatus::Quarantined => "quarantined",
            EventStatus::Enabled => "enabled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub stable_id: String,
    pub name: String,
    pub kind: EventKind,
    pub status: EventStatus,
    /// Total restart count for the workload at the time of the event.
    pub restart_count: u64,
    pub message: String,
}

impl EventRecord {
    pub fn new(
        stable_id: impl Into<String>,
        name: impl Into<String>,
        kind: EventKind,
        status: EventStatus,
        restart_count: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            stable_id: stable_id.into(),
            name: name.into(),
            kind,
            status,
            restart_count,
            message: message.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &EventRecord);
}

/// Sink that mirrors events into the structured log.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &EventRecord) {
        match event.status {
            EventStatus::Failure => tracing::warn!(
                container = %event.stable_id,
                kind = event.kind.as_str(),
                restarts = event.restart_count,
                "{}",
                event.message
            ),
            _ => tracing::info!(
                container = %event.stable_id,
                kind = event.kind.as_str(),
                status = event.status.as_str(),
                restarts = event.restart_count,
                "{}",
                event.message
            ),
        }
    }
}

/// Sink that counts events for the Prometheus exporter.
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn publish(&self, event: &EventRecord) {
        crate::api::metrics::record_event(event.kind.as_str(), event.status.as_str());
        if event.kind == EventKind::Restart {
            match event.status {
                EventStatus::Success => {
                    crate::api::metrics::increment_restarts(&event.stable_id)
                }
                EventStatus::Failure => {
                    crate::api::metrics::increment_restart_failures(&event.stable_id)
                }
                _ => {}
            }
        }
    }
}

/// Fans one event out to every sink and appends it to the durable ring.
pub struct EventBus {
    store: Arc<Store>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Publish an event. Persisting into the ring is best-effort: a store
    /// failure is logged but never propagated to the caller, because every
    /// publish site has already performed its real work.
    pub fn publish(&self, event: EventRecord) {
        for sink in &self.sinks {
            sink.publish(&event);
        }
        if let Err(e) = self.store.append_event(event) {
            tracing::warn!(error = %e, "Failed to persist event record");
        }
    }
}
