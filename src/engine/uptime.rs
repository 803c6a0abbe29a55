//! External uptime monitor integration.
//!
//! An out-of-band failure signal: when a mapped monitor reports DOWN, the
//! poller injects a synthetic health failure for the mapped container and
//! runs it through the same policy gate as a native healthcheck failure.
//! Cooldown, backoff and quarantine apply unchanged, so a flapping monitor
//! cannot restart a container any faster than its own healthcheck could.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, UptimeConfig};
use crate::events::{EventBus, EventKind, EventRecord, EventStatus};
use crate::identity;
use crate::policy::{self, Decision, SkipReason};
use crate::runtime::{ContainerRuntime, ContainerSnapshot, HealthStatus};
use crate::store::Store;

use super::{apply_quarantine, RestartExecutor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Up,
    Down,
    Pending,
    Maintenance,
    Unknown,
}

impl From<i64> for MonitorStatus {
    fn from(value: i64) -> Self {
        match value {
            0 => MonitorStatus::Down,
            1 => MonitorStatus::Up,
            2 => MonitorStatus::Pending,
            3 => MonitorStatus::Maintenance,
            _ => MonitorStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorState {
    pub friendly_name: String,
    pub status: MonitorStatus,
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Credentials rejected; polling is disabled until they change.
    #[error("uptime monitor rejected credentials ({0})")]
    Auth(String),
    #[error("unexpected uptime monitor response: {0}")]
    Protocol(String),
    #[error("uptime monitor request failed: {0}")]
    Http(String),
}

#[derive(Debug, Deserialize)]
struct MonitorsResponse {
    monitors: Vec<MonitorEntry>,
}

#[derive(Debug, Deserialize)]
struct MonitorEntry {
    #[serde(alias = "name")]
    friendly_name: String,
    status: Option<i64>,
}

pub struct UptimeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl UptimeClient {
    pub fn new(config: &UptimeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub async fn monitors(&self) -> Result<Vec<MonitorState>, IntegrationError> {
        let url = format!("{}/api/monitors", self.base_url);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        } else if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IntegrationError::Auth(status.to_string()));
        }
        if !status.is_success() {
            return Err(IntegrationError::Protocol(format!(
                "unexpected status {}",
                status
            )));
        }

        let body: MonitorsResponse = response
            .json()
            .await
            .map_err(|e| IntegrationError::Protocol(e.to_string()))?;

        Ok(body
            .monitors
            .into_iter()
            .map(|entry| MonitorState {
                status: entry
                    .status
                    .map(MonitorStatus::from)
                    .unwrap_or(MonitorStatus::Unknown),
                friendly_name: entry.friendly_name,
            })
            .collect())
    }
}

pub struct UptimePoller {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    executor: Arc<RestartExecutor>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl UptimePoller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<Store>,
        executor: Arc<RestartExecutor>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            store,
            executor,
            bus,
            shutdown,
        }
    }

    pub async fn run(self) {
        // Last seen status per monitor; a contiguous run of DOWN readings is
        // one failure episode.
        let mut episodes: HashMap<String, MonitorStatus> = HashMap::new();
        let mut client: Option<(String, UptimeClient)> = None;
        // Fingerprint of the credentials that last failed auth.
        let mut auth_blocked: Option<String> = None;

        tracing::info!("Uptime poller started");

        loop {
            let interval =
                Duration::from_secs(self.store.config().monitor.interval_seconds.max(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let config = self.store.config();
            if !config.uptime.enabled || config.uptime.base_url.is_empty() {
                episodes.clear();
                continue;
            }

            let fingerprint = credentials_fingerprint(&config.uptime);
            if auth_blocked.as_deref() == Some(fingerprint.as_str()) {
                continue;
            }

            let rebuild = client
                .as_ref()
                .map(|(existing, _)| existing != &fingerprint)
                .unwrap_or(true);
            if rebuild {
                match UptimeClient::new(&config.uptime) {
                    Ok(built) => client = Some((fingerprint.clone(), built)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to build uptime monitor client");
                        continue;
                    }
                }
            }
            let Some((_, ref active)) = client else {
                continue;
            };

            match active.monitors().await {
                Ok(monitors) => {
                    auth_blocked = None;
                    self.process(monitors, &config, &mut episodes).await;
                }
                Err(IntegrationError::Auth(msg)) => {
                    tracing::error!(
                        error = %msg,
                        "Uptime monitor rejected credentials; polling disabled until they change"
                    );
                    self.bus.publish(EventRecord::new(
                        "",
                        "",
                        EventKind::Error,
                        EventStatus::Failure,
                        0,
                        format!("Uptime integration disabled: {}", msg),
                    ));
                    auth_blocked = Some(fingerprint);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll uptime monitor");
                }
            }
        }

        tracing::info!("Uptime poller stopped");
    }

    async fn process(
        &self,
        monitors: Vec<MonitorState>,
        config: &Config,
        episodes: &mut HashMap<String, MonitorStatus>,
    ) {
        let snapshots = match self.runtime.list(true).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::debug!(error = %e, "Cannot resolve containers for uptime signals");
                return;
            }
        };
        let by_id: HashMap<String, ContainerSnapshot> = snapshots
            .into_iter()
            .map(|snapshot| (identity::resolve(&snapshot), snapshot))
            .collect();

        let now = Utc::now();

        for monitor in monitors {
            let Some(stable_id) = config.uptime.mappings.get(&monitor.friendly_name) else {
                continue;
            };

            let previous = episodes.insert(monitor.friendly_name.clone(), monitor.status);

            if monitor.status != MonitorStatus::Down {
                continue;
            }
            if !config.uptime.auto_restart_on_down {
                continue;
            }

            let new_episode = previous != Some(MonitorStatus::Down);
            if new_episode {
                tracing::warn!(
                    monitor = %monitor.friendly_name,
                    container = %stable_id,
                    "Uptime monitor went DOWN"
                );
            }

            let Some(snapshot) = by_id.get(stable_id) else {
                tracing::debug!(
                    monitor = %monitor.friendly_name,
                    container = %stable_id,
                    "Mapped container not present, ignoring DOWN signal"
                );
                continue;
            };

            // Inject the out-of-band signal as a healthcheck failure and let
            // the normal gate decide.
            let mut injected = snapshot.clone();
            injected.health = HealthStatus::Unhealthy;

            let facts = self.store.container_facts(stable_id, now);
            match policy::decide(&injected, &config.monitor, &config.restart, &facts, now) {
                Decision::Restart { .. } => {
                    let reason = format!(
                        "Uptime monitor '{}' reports DOWN",
                        monitor.friendly_name
                    );
                    self.executor.restart(stable_id, &injected, &reason).await;
                }
                Decision::Quarantine(reason) => {
                    apply_quarantine(&self.store, &self.bus, stable_id, &snapshot.name, &reason);
                }
                Decision::Skip(SkipReason::Cooldown { remaining }) => {
                    tracing::debug!(
                        monitor = %monitor.friendly_name,
                        container = %stable_id,
                        remaining_secs = remaining.as_secs(),
                        "DOWN signal deferred by cooldown"
                    );
                }
                Decision::Skip(reason) => {
                    tracing::debug!(
                        monitor = %monitor.friendly_name,
                        container = %stable_id,
                        reason = %reason,
                        "DOWN signal skipped"
                    );
                }
                Decision::Observe => {}
            }
        }

        // Forget monitors that are no longer mapped.
        episodes.retain(|name, _| config.uptime.mappings.contains_key(name));
    }
}

fn credentials_fingerprint(config: &UptimeConfig) -> String {
    format!(
        "{}|{}|{}|{}",
        config.base_url,
        config.api_key.as_deref().unwrap_or(""),
        config.username.as_deref().unwrap_or(""),
        config.password.as_deref().unwrap_or("")
    )
}
