//! The monitoring pass.
//!
//! One worker ticks at the configured interval: enumerate containers,
//! resolve each one's stable id, consult the policy engine and hand any
//! restart decisions to the executor. The loop itself never mutates restart
//! history or quarantine directly; the executor records restarts, and
//! quarantine transitions come out of policy decisions.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{EventBus, EventKind, EventRecord, EventStatus};
use crate::policy::{self, Decision, SkipReason};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::Store;
use crate::{api::metrics, identity};

use super::{apply_quarantine, describe_failure, EngineHealth, RestartExecutor};

pub struct MonitorLoop {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    executor: Arc<RestartExecutor>,
    bus: Arc<EventBus>,
    health: Arc<EngineHealth>,
    shutdown: CancellationToken,
}

impl MonitorLoop {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<Store>,
        executor: Arc<RestartExecutor>,
        bus: Arc<EventBus>,
        health: Arc<EngineHealth>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            store,
            executor,
            bus,
            health,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut interval_secs = self.store.config().monitor.interval_seconds;
        let mut ticker = interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Track outages across ticks so a long one produces a single event.
        let mut outage = false;

        tracing::info!(interval_secs, "Monitor loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let config = self.store.config();
            if config.monitor.interval_seconds != interval_secs {
                interval_secs = config.monitor.interval_seconds;
                ticker = interval(Duration::from_secs(interval_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tracing::info!(interval_secs, "Monitor interval updated");
            }

            let started = Instant::now();
            self.tick(&config, &mut outage).await;
            self.health.record_tick();

            let elapsed = started.elapsed();
            metrics::record_tick_duration(elapsed.as_secs_f64());
            if elapsed > Duration::from_secs(interval_secs) {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    interval_secs,
                    "Tick overran the monitor interval; missed ticks are skipped"
                );
            }
        }

        tracing::info!("Monitor loop stopped");
    }

    async fn tick(&self, config: &Config, outage: &mut bool) {
        let snapshots = match self.runtime.list(true).await {
            Ok(snapshots) => {
                if *outage {
                    tracing::info!("Container runtime connection restored");
                    *outage = false;
                }
                self.health.set_runtime_ok(true);
                metrics::set_runtime_available(true);
                snapshots
            }
            Err(RuntimeError::Unavailable(msg)) => {
                self.health.set_runtime_ok(false);
                metrics::set_runtime_available(false);
                if !*outage {
                    *outage = true;
                    tracing::warn!(error = %msg, "Container runtime unavailable, skipping pass");
                    self.bus.publish(EventRecord::new(
                        "",
                        "",
                        EventKind::Error,
                        EventStatus::Failure,
                        0,
                        format!("Container runtime unavailable: {}", msg),
                    ));
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list containers");
                return;
            }
        };

        let now = Utc::now();
        let total = snapshots.len();
        let mut monitored = 0usize;
        let mut restarts_dispatched = 0usize;
        let mut restarts = JoinSet::new();

        for snapshot in snapshots {
            let stable_id = identity::resolve(&snapshot);
            let facts = self.store.container_facts(&stable_id, now);

            if policy::is_monitored(&snapshot, &config.monitor, &facts) {
                monitored += 1;
            }

            match policy::decide(&snapshot, &config.monitor, &config.restart, &facts, now) {
                Decision::Restart { delay } => {
                    restarts_dispatched += 1;
                    let executor = self.executor.clone();
                    restarts.spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let reason = describe_failure(&snapshot);
                        executor.restart(&stable_id, &snapshot, &reason).await;
                    });
                }
                Decision::Quarantine(reason) => {
                    apply_quarantine(&self.store, &self.bus, &stable_id, &snapshot.name, &reason);
                }
                Decision::Skip(SkipReason::Cooldown { remaining }) => {
                    tracing::debug!(
                        container = %stable_id,
                        remaining_secs = remaining.as_secs(),
                        "Restart deferred by cooldown"
                    );
                }
                Decision::Skip(reason) => {
                    tracing::trace!(container = %stable_id, reason = %reason, "Container skipped");
                }
                Decision::Observe => {}
            }
        }

        // Restarts launched in this pass run concurrently across stable ids
        // but must land inside the tick deadline; stragglers are abandoned
        // and reconsidered next pass.
        let deadline = Duration::from_secs(config.monitor.interval_seconds.saturating_mul(2).max(1));
        let drained = tokio::time::timeout(deadline, async {
            while restarts.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                deadline_secs = deadline.as_secs(),
                "Tick deadline exceeded; abandoning in-flight restart tasks"
            );
            restarts.shutdown().await;
        }

        metrics::set_container_counts(total, monitored, self.store.quarantined().len());

        if restarts_dispatched > 0 {
            tracing::info!(
                checked = total,
                monitored,
                restarts = restarts_dispatched,
                "Monitoring pass completed"
            );
        } else {
            tracing::debug!(checked = total, monitored, "Monitoring pass completed (all quiet)");
        }
    }
}
