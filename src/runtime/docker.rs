use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StopContainerOptions};
use bollard::models::{ContainerStateStatusEnum, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    ContainerRuntime, ContainerSnapshot, ContainerStatus, HealthStatus, RuntimeError,
    RuntimeEvent, RuntimeEventStream,
};

/// Extra time granted to the start half of a restart after the stop
/// timeout has been consumed.
const START_GRACE: Duration = Duration::from_secs(30);

pub struct DockerRuntime {
    client: Docker,
}

/// Client-side timeout for daemon calls, in seconds.
const DAEMON_TIMEOUT_SECS: u64 = 120;

impl DockerRuntime {
    /// A tcp:// or http:// address reaches a remote daemon; anything else
    /// is a local unix socket path.
    pub fn new(socket: &str) -> anyhow::Result<Self> {
        let client = if socket.starts_with("tcp://") || socket.starts_with("http://") {
            Docker::connect_with_http(socket, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_socket(socket, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        };

        Ok(Self { client })
    }

    async fn inspect_snapshot(&self, runtime_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let info = self
            .client
            .inspect_container(runtime_id, None)
            .await
            .map_err(map_err)?;

        let state = info.state.unwrap_or_default();

        let status = match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::DEAD)
            | Some(ContainerStateStatusEnum::REMOVING)
            | Some(ContainerStateStatusEnum::EMPTY) => ContainerStatus::Dead,
            None => {
                if state.running.unwrap_or(false) {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                }
            }
        };

        let health = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
                HealthStatus::None
            }
        };

        let config = info.config.unwrap_or_default();

        Ok(ContainerSnapshot {
            runtime_id: info.id.unwrap_or_else(|| runtime_id.to_string()),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            status,
            exit_code: state.exit_code,
            health,
            labels: config.labels.unwrap_or_default(),
            started_at: state.started_at.as_deref().and_then(parse_started_at),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "Docker"
    }

    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        // Exit code and health are only exposed by inspect, so follow the
        // enumeration with one inspect per container.
        let inspects = summaries
            .iter()
            .filter_map(|summary| summary.id.as_deref())
            .map(|id| self.inspect_snapshot(id));

        let mut snapshots = Vec::with_capacity(summaries.len());
        for result in futures::future::join_all(inspects).await {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                // Vanished between list and inspect; it will show up next
                // tick if it comes back.
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(snapshots)
    }

    async fn inspect(&self, runtime_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        self.inspect_snapshot(runtime_id).await
    }

    async fn restart(&self, runtime_id: &str, stop_timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: stop_timeout.as_secs() as i64,
        };
        let deadline = stop_timeout + START_GRACE;

        let sequence = async {
            match self.client.stop_container(runtime_id, Some(options)).await {
                Ok(()) => {}
                // 304: already stopped. The start below still applies.
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => {}
                Err(e) => return Err(map_err(e)),
            }
            self.client
                .start_container::<String>(runtime_id, None)
                .await
                .map_err(map_err)
        };

        match tokio::time::timeout(deadline, sequence).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(stop_timeout.as_secs())),
        }
    }

    async fn events(&self) -> Result<RuntimeEventStream, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self.client.events(Some(options)).filter_map(|result| async move {
            match result {
                Ok(message) => {
                    let action = message.action?;
                    let runtime_id = message.actor.and_then(|actor| actor.id)?;
                    Some(Ok(RuntimeEvent { action, runtime_id }))
                }
                Err(e) => Some(Err(map_err(e))),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

fn map_err(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;

    match err {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        Error::DockerResponseServerError {
            status_code: 403,
            message,
        } => RuntimeError::Permission(message),
        Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Other(format!("daemon returned {}: {}", status_code, message)),
        // Anything below the HTTP layer means we cannot talk to the daemon.
        e => RuntimeError::Unavailable(e.to_string()),
    }
}

fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    // Docker reports 0001-01-01T00:00:00Z for never-started containers.
    if parsed.timestamp() <= 0 {
        return None;
    }
    Some(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_started_at_rfc3339() {
        let parsed = parse_started_at("2024-05-01T12:30:00.123456789Z").unwrap();
        assert_eq!(parsed.timestamp(), 1714566600);
    }

    #[test]
    fn test_parse_started_at_zero_value() {
        assert!(parse_started_at("0001-01-01T00:00:00Z").is_none());
    }

    #[test]
    fn test_parse_started_at_garbage() {
        assert!(parse_started_at("not-a-timestamp").is_none());
    }
}
