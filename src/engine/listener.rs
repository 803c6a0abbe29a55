//! Runtime event listener.
//!
//! Blocks on the daemon's container event stream and auto-enrolls labeled
//! containers the moment they start, so a freshly deployed workload is
//! monitored before the first polling pass sees it. The stream legally ends
//! when the daemon restarts; this task reconnects forever and only exits on
//! shutdown.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventKind, EventRecord, EventStatus};
use crate::identity;
use crate::runtime::{ContainerRuntime, RuntimeError, RuntimeEventStream};
use crate::store::Store;

/// Events buffered between the stream reader and the enroll handler.
const QUEUE_CAPACITY: usize = 256;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

pub struct EventListener {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl EventListener {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            store,
            bus,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut backoff = INITIAL_RECONNECT_DELAY;

        tracing::info!("Event listener started");

        while !self.shutdown.is_cancelled() {
            match self.runtime.events().await {
                Ok(stream) => {
                    if self.consume(stream).await {
                        backoff = INITIAL_RECONNECT_DELAY;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to subscribe to runtime events");
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            tracing::warn!(
                retry_secs = backoff.as_secs(),
                "Runtime event stream ended; reconnecting"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
        }

        tracing::info!("Event listener stopped");
    }

    /// Drain one stream until it ends. The stream is read by a dedicated
    /// task feeding a bounded queue, so a slow enroll (inspect plus store
    /// write) never stalls the daemon-side reader. Returns whether any
    /// event arrived, which resets the reconnect backoff.
    async fn consume(&self, mut stream: RuntimeEventStream) -> bool {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let shutdown = self.shutdown.clone();

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "Runtime event stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        let mut received = false;
        while let Some(event) = rx.recv().await {
            received = true;
            if event.action == "start" {
                self.handle_start(&event.runtime_id).await;
            }
        }

        let _ = reader.await;
        received
    }

    async fn handle_start(&self, runtime_id: &str) {
        let snapshot = match self.runtime.inspect(runtime_id).await {
            Ok(snapshot) => snapshot,
            // Started and vanished again; nothing to enroll.
            Err(RuntimeError::NotFound(_)) => return,
            Err(e) => {
                tracing::debug!(runtime_id = %runtime_id, error = %e, "Failed to inspect started container");
                return;
            }
        };

        let config = self.store.config();
        if snapshot.labels.get(&config.monitor.label_key) != Some(&config.monitor.label_value) {
            return;
        }

        let stable_id = identity::resolve(&snapshot);
        if config.monitor.excluded.contains(&stable_id) {
            tracing::debug!(container = %stable_id, "Labeled container is excluded, not enrolling");
            return;
        }

        match self.store.select(&stable_id) {
            Ok(true) => {
                self.bus.publish(EventRecord::new(
                    &stable_id,
                    &snapshot.name,
                    EventKind::AutoMonitor,
                    EventStatus::Enabled,
                    self.store.count_total(&stable_id),
                    format!("Auto-enrolled {} for monitoring", snapshot.name),
                ));
            }
            // Already selected; repeated start events are a no-op.
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(container = %stable_id, error = %e, "Failed to enroll container");
            }
        }
    }
}
