//! System status endpoint for the dashboard.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::{identity, policy, AppState};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: u64,
    /// Whether automated restarts are globally suppressed
    pub maintenance: bool,
    pub maintenance_since: Option<DateTime<Utc>>,
    pub runtime_connected: bool,
    /// When the monitor loop last completed a pass
    pub last_tick: Option<DateTime<Utc>>,
    pub total_containers: usize,
    pub monitored_containers: usize,
    pub quarantined_containers: usize,
    pub event_count: usize,
}

/// GET /api/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let config = state.store.config();
    let maintenance = state.store.maintenance();
    let now = Utc::now();

    let (total, monitored, runtime_connected) = match state.runtime.list(true).await {
        Ok(snapshots) => {
            let total = snapshots.len();
            let monitored = snapshots
                .iter()
                .filter(|snapshot| {
                    let stable_id = identity::resolve(snapshot);
                    let facts = state.store.container_facts(&stable_id, now);
                    policy::is_monitored(snapshot, &config.monitor, &facts)
                })
                .count();
            (total, monitored, true)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Status request could not reach the runtime");
            (0, 0, false)
        }
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.health.uptime_seconds(),
        maintenance: maintenance.active,
        maintenance_since: maintenance.activated_at,
        runtime_connected,
        last_tick: state.health.last_tick(),
        total_containers: total,
        monitored_containers: monitored,
        quarantined_containers: state.store.quarantined().len(),
        event_count: state.store.event_count(),
    })
}
