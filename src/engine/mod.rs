mod executor;
mod listener;
mod monitor;
mod uptime;

pub use executor::{RestartExecutor, RestartOutcome};
pub use listener::EventListener;
pub use monitor::MonitorLoop;
pub use uptime::{IntegrationError, MonitorState, MonitorStatus, UptimeClient, UptimePoller};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::events::{EventBus, EventKind, EventRecord, EventStatus};
use crate::policy::QuarantineReason;
use crate::runtime::{ContainerSnapshot, HealthStatus};
use crate::store::Store;

/// Liveness signals for the status surface: when the loop last completed a
/// pass and whether the runtime answered.
pub struct EngineHealth {
    started_at: DateTime<Utc>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    runtime_ok: AtomicBool,
}

impl EngineHealth {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            last_tick: Mutex::new(None),
            runtime_ok: AtomicBool::new(false),
        }
    }

    pub fn record_tick(&self) {
        *self.last_tick.lock() = Some(Utc::now());
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        *self.last_tick.lock()
    }

    pub fn set_runtime_ok(&self, ok: bool) {
        self.runtime_ok.store(ok, Ordering::Relaxed);
    }

    pub fn runtime_ok(&self) -> bool {
        self.runtime_ok.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable description of the failure a snapshot exhibits. A failing
/// healthcheck outranks the exit code.
pub(crate) fn describe_failure(snapshot: &ContainerSnapshot) -> String {
    if snapshot.health == HealthStatus::Unhealthy {
        format!("Container {} reported unhealthy", snapshot.name)
    } else {
        format!(
            "Container {} exited with code {}",
            snapshot.name,
            snapshot.exit_code.unwrap_or(0)
        )
    }
}

/// Move a stable id into quarantine and record the transition. Idempotent:
/// only a fresh transition produces an event.
pub(crate) fn apply_quarantine(
    store: &Store,
    bus: &EventBus,
    stable_id: &str,
    name: &str,
    reason: &QuarantineReason,
) {
    match store.quarantine(stable_id) {
        Ok(true) => {
            tracing::warn!(container = %stable_id, reason = %reason, "Container quarantined");
            bus.publish(EventRecord::new(
                stable_id,
                name,
                EventKind::Quarantine,
                EventStatus::Quarantined,
                store.count_total(stable_id),
                format!("Quarantined: {}", reason),
            ));
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(container = %stable_id, error = %e, "Failed to persist quarantine");
            bus.publish(EventRecord::new(
                stable_id,
                name,
                EventKind::Error,
                EventStatus::Failure,
                store.count_total(stable_id),
                format!("Failed to persist quarantine: {}", e),
            ));
        }
    }
}
