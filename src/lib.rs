pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod identity;
pub mod policy;
pub mod runtime;
pub mod store;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::engine::{EngineHealth, RestartExecutor};
use crate::events::EventBus;
use crate::runtime::ContainerRuntime;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<Store>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub executor: Arc<RestartExecutor>,
    pub bus: Arc<EventBus>,
    pub health: Arc<EngineHealth>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        runtime: Arc<dyn ContainerRuntime>,
        executor: Arc<RestartExecutor>,
        bus: Arc<EventBus>,
        health: Arc<EngineHealth>,
    ) -> Self {
        Self {
            store,
            runtime,
            executor,
            bus,
            health,
            metrics_handle: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
