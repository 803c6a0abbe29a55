//! Monitor-to-container mapping management for the uptime integration.

use axum::{
    extract::{Path, State},
    Json,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::AppState;

use super::error::ApiError;

/// GET /api/uptime/mappings
pub async fn get_mappings(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, String>> {
    Json(state.store.config().uptime.mappings.clone())
}

/// PUT /api/uptime/mappings, replacing the whole map.
pub async fn put_mappings(
    State(state): State<Arc<AppState>>,
    Json(mappings): Json<BTreeMap<String, String>>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let mut section = state.store.config().uptime.clone();
    section.mappings = mappings;
    let config = state.store.put_uptime(section)?;
    Ok(Json(config.uptime.mappings.clone()))
}

/// DELETE /api/uptime/mappings/:monitor
pub async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    Path(monitor): Path<String>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let mut section = state.store.config().uptime.clone();
    if section.mappings.remove(&monitor).is_none() {
        return Err(ApiError::not_found(format!(
            "No mapping for monitor {}",
            monitor
        )));
    }
    let config = state.store.put_uptime(section)?;
    Ok(Json(config.uptime.mappings.clone()))
}
