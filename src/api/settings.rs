//! Configuration and maintenance endpoints.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{
    Config, MonitorConfig, ObservabilityConfig, RestartConfig, UptimeConfig,
};
use crate::AppState;

use super::error::ApiError;

/// GET /api/config
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json((*state.store.config()).clone())
}

/// PUT /api/config/monitor
pub async fn put_monitor(
    State(state): State<Arc<AppState>>,
    Json(section): Json<MonitorConfig>,
) -> Result<Json<Config>, ApiError> {
    let config = state.store.put_monitor(section)?;
    tracing::info!("Monitor configuration updated");
    Ok(Json((*config).clone()))
}

/// PUT /api/config/restart
pub async fn put_restart(
    State(state): State<Arc<AppState>>,
    Json(section): Json<RestartConfig>,
) -> Result<Json<Config>, ApiError> {
    let config = state.store.put_restart(section)?;
    tracing::info!("Restart policy updated");
    Ok(Json((*config).clone()))
}

/// PUT /api/config/observability
pub async fn put_observability(
    State(state): State<Arc<AppState>>,
    Json(section): Json<ObservabilityConfig>,
) -> Result<Json<Config>, ApiError> {
    let config = state.store.put_observability(section)?;
    tracing::info!("Observability configuration updated");
    Ok(Json((*config).clone()))
}

/// PUT /api/config/uptime
pub async fn put_uptime(
    State(state): State<Arc<AppState>>,
    Json(section): Json<UptimeConfig>,
) -> Result<Json<Config>, ApiError> {
    let config = state.store.put_uptime(section)?;
    tracing::info!("Uptime integration configuration updated");
    Ok(Json((*config).clone()))
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct MaintenanceResponse {
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
}

/// PUT /api/maintenance
pub async fn put_maintenance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceResponse>, ApiError> {
    let flag = state.store.set_maintenance(request.active)?;
    if flag.active {
        tracing::warn!("Maintenance mode enabled; automated restarts suppressed");
    } else {
        tracing::info!("Maintenance mode disabled; automated restarts resume");
    }
    Ok(Json(MaintenanceResponse {
        active: flag.active,
        activated_at: flag.activated_at,
    }))
}
