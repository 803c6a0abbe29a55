mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Exited,
    Paused,
    Restarting,
    Created,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Created => "created",
            ContainerStatus::Dead => "dead",
        }
    }
}

/// Health-check state. `None` means the image defines no healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::None => "none",
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time view of one container. Produced on demand, never persisted.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub health: HealthStatus,
    pub labels: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A container lifecycle event from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    /// Lifecycle action, e.g. "start", "die", "stop".
    pub action: String,
    pub runtime_id: String,
}

pub type RuntimeEventStream =
    Pin<Box<dyn Stream<Item = Result<RuntimeEvent, RuntimeError>> + Send>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon cannot be reached. Transient; never fatal.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// Container vanished between list and operate.
    #[error("container not found: {0}")]
    NotFound(String),
    /// Operation raced against another (e.g. already restarting).
    #[error("operation conflict: {0}")]
    Conflict(String),
    #[error("operation timed out after {0}s")]
    Timeout(u64),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Short machine-readable kind, used in event messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Unavailable(_) => "runtime-unavailable",
            RuntimeError::NotFound(_) => "not-found",
            RuntimeError::Conflict(_) => "conflict",
            RuntimeError::Timeout(_) => "timeout",
            RuntimeError::Permission(_) => "permission",
            RuntimeError::Other(_) => "error",
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate containers. A single consistent enumeration call; the
    /// returned snapshots carry labels, state, health and exit code.
    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    async fn inspect(&self, runtime_id: &str) -> Result<ContainerSnapshot, RuntimeError>;

    /// Stop with the given timeout, then start. The stop timeout is also the
    /// grace the daemon gives the process before SIGKILL.
    async fn restart(&self, runtime_id: &str, stop_timeout: Duration) -> Result<(), RuntimeError>;

    /// Never-ending stream of container lifecycle events. The stream may
    /// legally terminate when the daemon restarts; callers reconnect.
    async fn events(&self) -> Result<RuntimeEventStream, RuntimeError>;

    async fn is_available(&self) -> bool;
}

/// Connect to the runtime socket. An unreachable daemon is not an error
/// here: the monitor loop retries every tick, so we hand back the client
/// and let availability sort itself out.
pub async fn connect(socket: &str) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::new(socket)?;
    if runtime.is_available().await {
        tracing::info!(socket = %socket, "Connected to container runtime");
    } else {
        tracing::warn!(
            socket = %socket,
            "Container runtime not reachable yet; will keep retrying"
        );
    }
    Ok(Arc::new(runtime))
}
