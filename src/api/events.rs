//! Event log endpoints.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::events::EventRecord;
use crate::AppState;

use super::error::ApiError;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/events?limit=n, newest first.
pub async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<EventRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Json(state.store.recent_events(limit))
}

/// DELETE /api/events
pub async fn clear_events(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.clear_events()?;
    tracing::info!("Event log cleared");
    Ok(Json(serde_json::json!({ "cleared": true })))
}
