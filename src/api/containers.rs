//! Container read-models and per-container mutations.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::RestartOutcome;
use crate::events::{EventKind, EventRecord, EventStatus};
use crate::runtime::{ContainerSnapshot, ContainerStatus, HealthStatus};
use crate::{identity, policy, AppState};

use super::error::ApiError;

/// A container snapshot enriched with the engine's durable view of it.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub stable_id: String,
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub monitored: bool,
    pub quarantined: bool,
    pub total_restart_count: u64,
    pub recent_restart_count: usize,
    pub last_restart: Option<DateTime<Utc>>,
}

fn enrich(state: &AppState, snapshot: ContainerSnapshot, now: DateTime<Utc>) -> ContainerInfo {
    let stable_id = identity::resolve(&snapshot);
    let config = state.store.config();
    let facts = state.store.container_facts(&stable_id, now);
    ContainerInfo {
        monitored: policy::is_monitored(&snapshot, &config.monitor, &facts),
        quarantined: facts.quarantined,
        total_restart_count: facts.total_restarts,
        recent_restart_count: facts.recent_restarts,
        last_restart: facts.last_restart,
        stable_id,
        runtime_id: snapshot.runtime_id,
        name: snapshot.name,
        image: snapshot.image,
        status: snapshot.status,
        health: snapshot.health,
        exit_code: snapshot.exit_code,
        started_at: snapshot.started_at,
    }
}

async fn find_snapshot(
    state: &AppState,
    stable_id: &str,
) -> Result<ContainerSnapshot, ApiError> {
    let snapshots = state.runtime.list(true).await?;
    snapshots
        .into_iter()
        .find(|snapshot| identity::resolve(snapshot) == stable_id)
        .ok_or_else(|| ApiError::not_found(format!("No container with stable id {}", stable_id)))
}

/// GET /api/containers
pub async fn list_containers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ContainerInfo>>, ApiError> {
    let snapshots = state.runtime.list(true).await?;
    let now = Utc::now();
    let containers = snapshots
        .into_iter()
        .map(|snapshot| enrich(&state, snapshot, now))
        .collect();
    Ok(Json(containers))
}

/// GET /api/containers/:stable_id
pub async fn get_container(
    State(state): State<Arc<AppState>>,
    Path(stable_id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    let snapshot = find_snapshot(&state, &stable_id).await?;
    Ok(Json(enrich(&state, snapshot, Utc::now())))
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub stable_id: String,
    pub restarted: bool,
}

/// POST /api/containers/:stable_id/restart
///
/// Manual restarts go through the same executor as automatic ones, so the
/// per-id serialization and restart accounting hold. They do not consult
/// the monitored set: an explicit operator request is obeyed.
pub async fn restart_container(
    State(state): State<Arc<AppState>>,
    Path(stable_id): Path<String>,
) -> Result<Json<RestartResponse>, ApiError> {
    let snapshot = find_snapshot(&state, &stable_id).await?;

    match state
        .executor
        .restart(&stable_id, &snapshot, "Manual restart requested")
        .await
    {
        RestartOutcome::Completed => Ok(Json(RestartResponse {
            stable_id,
            restarted: true,
        })),
        RestartOutcome::AlreadyInFlight => Err(ApiError::conflict(
            "A restart for this container is already in flight",
        )),
        RestartOutcome::Dropped => Err(ApiError::not_found("Container vanished during restart")),
        RestartOutcome::Failed => Err(ApiError::internal(
            "Restart failed; see the event log for details",
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct SelectionResponse {
    pub stable_id: String,
    pub selected: bool,
}

/// POST /api/containers/:stable_id/select
pub async fn select_container(
    State(state): State<Arc<AppState>>,
    Path(stable_id): Path<String>,
) -> Result<Json<SelectionResponse>, ApiError> {
    state.store.select(&stable_id)?;
    Ok(Json(SelectionResponse {
        stable_id,
        selected: true,
    }))
}

/// POST /api/containers/:stable_id/deselect
pub async fn deselect_container(
    State(state): State<Arc<AppState>>,
    Path(stable_id): Path<String>,
) -> Result<Json<SelectionResponse>, ApiError> {
    state.store.deselect(&stable_id)?;
    Ok(Json(SelectionResponse {
        stable_id,
        selected: false,
    }))
}

#[derive(Debug, Serialize)]
pub struct UnquarantineResponse {
    pub stable_id: String,
    pub quarantined: bool,
}

/// DELETE /api/containers/:stable_id/quarantine
///
/// Clears the quarantine entry and the restart record, so the workload
/// re-enters monitoring with a clean rate window.
pub async fn unquarantine_container(
    State(state): State<Arc<AppState>>,
    Path(stable_id): Path<String>,
) -> Result<Json<UnquarantineResponse>, ApiError> {
    if !state.store.unquarantine(&stable_id)? {
        return Err(ApiError::not_found(format!(
            "{} is not quarantined",
            stable_id
        )));
    }

    state.bus.publish(EventRecord::new(
        &stable_id,
        &stable_id,
        EventKind::Unquarantine,
        EventStatus::Success,
        0,
        format!("Quarantine removed for {}", stable_id),
    ));

    Ok(Json(UnquarantineResponse {
        stable_id,
        quarantined: false,
    }))
}
