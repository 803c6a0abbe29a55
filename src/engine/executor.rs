//! Restart execution.
//!
//! The executor owns the two hard invariants around actually touching the
//! runtime: at most one in-flight restart per stable id (keyed off the
//! stable id, so recreated containers still serialize), and every outcome
//! is accounted for in the durable store and the event log. Errors are not
//! retried here; the next monitoring pass reconsiders.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use crate::events::{EventBus, EventKind, EventRecord, EventStatus};
use crate::runtime::{ContainerRuntime, ContainerSnapshot, RuntimeError};
use crate::store::Store;

/// Upper bound on simultaneous restart operations across all workloads.
const MAX_CONCURRENT_RESTARTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Completed,
    Failed,
    /// Another restart for the same stable id is already running; this
    /// signal was dropped, not queued.
    AlreadyInFlight,
    /// The container vanished between observation and restart.
    Dropped,
}

pub struct RestartExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
}

impl RestartExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            runtime,
            store,
            bus,
            locks: DashMap::new(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_RESTARTS)),
        }
    }

    pub async fn restart(
        &self,
        stable_id: &str,
        snapshot: &ContainerSnapshot,
        reason: &str,
    ) -> RestartOutcome {
        let lock = self
            .locks
            .entry(stable_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(container = %stable_id, "Restart already in flight, dropping signal");
            return RestartOutcome::AlreadyInFlight;
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return RestartOutcome::Failed,
        };

        let config = self.store.config();
        let stop_timeout = Duration::from_secs(config.restart.stop_timeout_seconds);

        self.bus.publish(EventRecord::new(
            stable_id,
            &snapshot.name,
            EventKind::HealthCheckFailed,
            EventStatus::Failure,
            self.store.count_total(stable_id),
            reason,
        ));

        tracing::info!(
            container = %stable_id,
            runtime_id = %snapshot.runtime_id,
            stop_timeout_secs = stop_timeout.as_secs(),
            "Restarting container"
        );

        match self.runtime.restart(&snapshot.runtime_id, stop_timeout).await {
            Ok(()) => {
                self.record_restart(stable_id, &snapshot.name);
                self.bus.publish(EventRecord::new(
                    stable_id,
                    &snapshot.name,
                    EventKind::Restart,
                    EventStatus::Success,
                    self.store.count_total(stable_id),
                    format!("Container {} restarted", snapshot.name),
                ));
                RestartOutcome::Completed
            }
            Err(RuntimeError::NotFound(_)) => {
                tracing::debug!(
                    container = %stable_id,
                    "Container vanished before restart, dropping operation"
                );
                RestartOutcome::Dropped
            }
            Err(err) => {
                // A timeout still consumed a stop/start cycle on the daemon
                // side, so it counts against the rate window.
                if matches!(err, RuntimeError::Timeout(_)) {
                    self.record_restart(stable_id, &snapshot.name);
                }
                tracing::error!(container = %stable_id, error = %err, "Failed to restart container");
                self.bus.publish(EventRecord::new(
                    stable_id,
                    &snapshot.name,
                    EventKind::Restart,
                    EventStatus::Failure,
                    self.store.count_total(stable_id),
                    format!("Failed to restart {}: {} ({})", snapshot.name, err, err.kind()),
                ));
                RestartOutcome::Failed
            }
        }
    }

    /// The restart has already happened at this point; a store failure only
    /// under-counts the rate window by one and must not fail the operation.
    fn record_restart(&self, stable_id: &str, name: &str) {
        if let Err(e) = self.store.record_restart(stable_id, Utc::now()) {
            tracing::error!(container = %stable_id, error = %e, "Failed to record restart");
            self.bus.publish(EventRecord::new(
                stable_id,
                name,
                EventKind::Error,
                EventStatus::Failure,
                self.store.count_total(stable_id),
                format!("Restart performed but not recorded: {}", e),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::runtime::{
        ContainerStatus, HealthStatus, RuntimeEventStream,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime stub whose restart takes a while, for exercising the per-id
    /// serialization.
    struct SlowRuntime {
        restarts: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ContainerRuntime for SlowRuntime {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn list(
            &self,
            _include_stopped: bool,
        ) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
            Ok(vec![])
        }

        async fn inspect(&self, runtime_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
            Err(RuntimeError::NotFound(runtime_id.to_string()))
        }

        async fn restart(
            &self,
            _runtime_id: &str,
            _stop_timeout: Duration,
        ) -> Result<(), RuntimeError> {
            tokio::time::sleep(self.delay).await;
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn events(&self) -> Result<RuntimeEventStream, RuntimeError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn test_snapshot(name: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            runtime_id: format!("{}-runtime-id", name),
            name: name.to_string(),
            image: "example:latest".to_string(),
            status: ContainerStatus::Running,
            exit_code: None,
            health: HealthStatus::Unhealthy,
            labels: HashMap::new(),
            started_at: None,
        }
    }

    fn executor_with(delay: Duration) -> (tempfile::TempDir, Arc<SlowRuntime>, RestartExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let runtime = Arc::new(SlowRuntime {
            restarts: AtomicUsize::new(0),
            delay,
        });
        let bus = Arc::new(EventBus::new(store.clone()));
        let executor = RestartExecutor::new(runtime.clone(), store, bus);
        (dir, runtime, executor)
    }

    #[tokio::test]
    async fn test_concurrent_signals_serialize_per_id() {
        let (_dir, runtime, executor) = executor_with(Duration::from_millis(100));
        let executor = Arc::new(executor);
        let snapshot = test_snapshot("svc_a");

        let first = {
            let executor = executor.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move { executor.restart("svc_a", &snapshot, "unhealthy").await })
        };
        // Give the first signal time to take the lock.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = executor.restart("svc_a", &snapshot, "uptime monitor DOWN").await;

        assert_eq!(second, RestartOutcome::AlreadyInFlight);
        assert_eq!(first.await.unwrap(), RestartOutcome::Completed);
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_run_concurrently() {
        let (_dir, runtime, executor) = executor_with(Duration::from_millis(50));
        let executor = Arc::new(executor);

        let a = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.restart("svc_a", &test_snapshot("svc_a"), "unhealthy").await
            })
        };
        let b = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.restart("svc_b", &test_snapshot("svc_b"), "unhealthy").await
            })
        };

        assert_eq!(a.await.unwrap(), RestartOutcome::Completed);
        assert_eq!(b.await.unwrap(), RestartOutcome::Completed);
        assert_eq!(runtime.restarts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_successful_restart_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let runtime = Arc::new(SlowRuntime {
            restarts: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let bus = Arc::new(EventBus::new(store.clone()));
        let executor = RestartExecutor::new(runtime, store.clone(), bus);

        let outcome = executor
            .restart("svc_a", &test_snapshot("svc_a"), "unhealthy")
            .await;

        assert_eq!(outcome, RestartOutcome::Completed);
        assert_eq!(store.count_total("svc_a"), 1);

        // Intent and success events landed in the ring, newest first.
        let events = store.recent_events(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Restart);
        assert_eq!(events[0].status, EventStatus::Success);
        assert_eq!(events[1].kind, EventKind::HealthCheckFailed);
    }
}
