mod containers;
pub mod error;
mod events;
pub mod metrics;
mod settings;
mod system;
mod uptime;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Management API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(system::get_status))
        // Containers
        .route("/api/containers", get(containers::list_containers))
        .route("/api/containers/:stable_id", get(containers::get_container))
        .route(
            "/api/containers/:stable_id/restart",
            post(containers::restart_container),
        )
        .route(
            "/api/containers/:stable_id/select",
            post(containers::select_container),
        )
        .route(
            "/api/containers/:stable_id/deselect",
            post(containers::deselect_container),
        )
        .route(
            "/api/containers/:stable_id/quarantine",
            delete(containers::unquarantine_container),
        )
        // Events
        .route(
            "/api/events",
            get(events::recent_events).delete(events::clear_events),
        )
        // Configuration
        .route("/api/config", get(settings::get_config))
        .route("/api/config/monitor", put(settings::put_monitor))
        .route("/api/config/restart", put(settings::put_restart))
        .route(
            "/api/config/observability",
            put(settings::put_observability),
        )
        .route("/api/config/uptime", put(settings::put_uptime))
        .route("/api/maintenance", put(settings::put_maintenance))
        // Uptime integration
        .route(
            "/api/uptime/mappings",
            get(uptime::get_mappings).put(uptime::put_mappings),
        )
        .route(
            "/api/uptime/mappings/:monitor",
            delete(uptime::delete_mapping),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Separate router for the metrics port.
pub fn metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics_endpoint))
        .with_state(state)
}
