//! Durable store: the only shared mutable state in the process.
//!
//! Every logical table (configuration + restart history, event ring,
//! quarantine set, maintenance flag) is an independent JSON artifact in the
//! data directory, written atomically (temp file, fsync, rename). Writers
//! serialize on one lock and commit to memory only after the artifact is on
//! disk, so the in-memory model can never diverge from the persisted one.
//! Readers get cheap immutable snapshots.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, MonitorConfig, ObservabilityConfig, PolicyViolation, RestartConfig, UptimeConfig};
use crate::events::EventRecord;
use crate::policy::ContainerFacts;

const ARTIFACT_VERSION: u32 = 1;

const CONFIG_FILE: &str = "config.json";
const EVENTS_FILE: &str = "events.json";
const QUARANTINE_FILE: &str = "quarantine.json";
const MAINTENANCE_FILE: &str = "maintenance.json";

/// Stored timestamps per workload are capped; older ones roll into the
/// overflow counter so the displayed total stays accurate.
pub const HISTORY_CAP: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to persist {artifact}: {source}")]
    Io {
        artifact: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {artifact}: {source}")]
    Encode {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Append-only restart accounting for one stable id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartHistory {
    #[serde(default)]
    timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    overflow: u64,
}

impl RestartHistory {
    pub fn total(&self) -> u64 {
        self.overflow + self.timestamps.len() as u64
    }

    /// Restarts with `t > now - window`.
    pub fn recent(&self, now: DateTime<Utc>, window_seconds: u64) -> usize {
        let cutoff = now - Duration::seconds(window_seconds as i64);
        self.timestamps.iter().filter(|t| **t > cutoff).count()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    fn record(&mut self, t: DateTime<Utc>) {
        self.timestamps.push(t);
        if self.timestamps.len() > HISTORY_CAP {
            let excess = self.timestamps.len() - HISTORY_CAP;
            self.timestamps.drain(..excess);
            self.overflow += excess as u64;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MaintenanceFlag {
    pub active: bool,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ConfigArtifact {
    version: u32,
    settings: Config,
    #[serde(default)]
    restart_history: BTreeMap<String, RestartHistory>,
}

#[derive(Serialize, Deserialize)]
struct EventsArtifact {
    version: u32,
    #[serde(default)]
    events: Vec<EventRecord>,
}

#[derive(Serialize, Deserialize)]
struct QuarantineArtifact {
    version: u32,
    #[serde(default)]
    quarantined: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct MaintenanceArtifact {
    version: u32,
    #[serde(flatten)]
    flag: MaintenanceFlag,
}

struct State {
    config: Arc<Config>,
    history: BTreeMap<String, RestartHistory>,
    quarantine: BTreeSet<String>,
    events: VecDeque<EventRecord>,
    maintenance: MaintenanceFlag,
}

pub struct Store {
    dir: PathBuf,
    inner: RwLock<State>,
}

impl Store {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        let (config, history) = match load_artifact::<ConfigArtifact>(&dir, CONFIG_FILE)? {
            Some(artifact) => (artifact.settings, artifact.restart_history),
            None => (Config::default(), BTreeMap::new()),
        };

        // A persisted config that violates the policy constraints is kept
        // (the engine still runs with it) but flagged loudly; the
        // management surface rejects writes that would reintroduce it.
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "Persisted configuration violates policy constraints");
        }

        let events: VecDeque<EventRecord> = load_artifact::<EventsArtifact>(&dir, EVENTS_FILE)?
            .map(|artifact| artifact.events.into())
            .unwrap_or_default();

        let quarantine = load_artifact::<QuarantineArtifact>(&dir, QUARANTINE_FILE)?
            .map(|artifact| artifact.quarantined)
            .unwrap_or_default();

        let maintenance = load_artifact::<MaintenanceArtifact>(&dir, MAINTENANCE_FILE)?
            .map(|artifact| artifact.flag)
            .unwrap_or_default();

        Ok(Self {
            dir,
            inner: RwLock::new(State {
                config: Arc::new(config),
                history,
                quarantine,
                events,
                maintenance,
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Immutable snapshot of the current configuration. In-flight work keeps
    /// the snapshot it started with; later reads observe later writes.
    pub fn config(&self) -> Arc<Config> {
        self.inner.read().config.clone()
    }

    pub fn put_monitor(&self, section: MonitorConfig) -> Result<Arc<Config>, ConfigWriteError> {
        self.update_config(|config| config.monitor = section)
    }

    pub fn put_restart(&self, section: RestartConfig) -> Result<Arc<Config>, ConfigWriteError> {
        self.update_config(|config| config.restart = section)
    }

    pub fn put_observability(
        &self,
        section: ObservabilityConfig,
    ) -> Result<Arc<Config>, ConfigWriteError> {
        self.update_config(|config| config.observability = section)
    }

    pub fn put_uptime(&self, section: UptimeConfig) -> Result<Arc<Config>, ConfigWriteError> {
        self.update_config(|config| config.uptime = section)
    }

    fn update_config<F>(&self, mutate: F) -> Result<Arc<Config>, ConfigWriteError>
    where
        F: FnOnce(&mut Config),
    {
        let mut state = self.inner.write();
        let mut next = (*state.config).clone();
        mutate(&mut next);
        next.validate()?;
        self.persist_config(&next, &state.history)?;
        state.config = Arc::new(next);
        Ok(state.config.clone())
    }

    /// Add a stable id to the selected set. Returns false when it was
    /// already selected (idempotent, nothing persisted).
    pub fn select(&self, stable_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write();
        if state.config.monitor.selected.contains(stable_id) {
            return Ok(false);
        }
        let mut next = (*state.config).clone();
        next.monitor.selected.insert(stable_id.to_string());
        self.persist_config(&next, &state.history)?;
        state.config = Arc::new(next);
        Ok(true)
    }

    pub fn deselect(&self, stable_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write();
        if !state.config.monitor.selected.contains(stable_id) {
            return Ok(false);
        }
        let mut next = (*state.config).clone();
        next.monitor.selected.remove(stable_id);
        self.persist_config(&next, &state.history)?;
        state.config = Arc::new(next);
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Restart history
    // ---------------------------------------------------------------------

    pub fn record_restart(&self, stable_id: &str, t: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let mut next = state.history.clone();
        next.entry(stable_id.to_string()).or_default().record(t);
        self.persist_config(&state.config, &next)?;
        state.history = next;
        Ok(())
    }

    pub fn clear_restart_history(&self, stable_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if !state.history.contains_key(stable_id) {
            return Ok(());
        }
        let mut next = state.history.clone();
        next.remove(stable_id);
        self.persist_config(&state.config, &next)?;
        state.history = next;
        Ok(())
    }

    pub fn count_recent(&self, stable_id: &str, window_seconds: u64, now: DateTime<Utc>) -> usize {
        self.inner
            .read()
            .history
            .get(stable_id)
            .map(|h| h.recent(now, window_seconds))
            .unwrap_or(0)
    }

    pub fn count_total(&self, stable_id: &str) -> u64 {
        self.inner
            .read()
            .history
            .get(stable_id)
            .map(|h| h.total())
            .unwrap_or(0)
    }

    pub fn last_restart(&self, stable_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().history.get(stable_id).and_then(|h| h.last())
    }

    // ---------------------------------------------------------------------
    // Quarantine
    // ---------------------------------------------------------------------

    /// Returns true when the id was newly quarantined.
    pub fn quarantine(&self, stable_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write();
        if state.quarantine.contains(stable_id) {
            return Ok(false);
        }
        let mut next = state.quarantine.clone();
        next.insert(stable_id.to_string());
        self.persist_quarantine(&next)?;
        state.quarantine = next;
        Ok(true)
    }

    /// Remove an id from quarantine and wipe its restart record, so the
    /// workload re-enters monitoring with a clean rate window.
    pub fn unquarantine(&self, stable_id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write();
        if !state.quarantine.contains(stable_id) {
            return Ok(false);
        }

        let mut next_history = state.history.clone();
        next_history.remove(stable_id);
        self.persist_config(&state.config, &next_history)?;
        state.history = next_history;

        let mut next_quarantine = state.quarantine.clone();
        next_quarantine.remove(stable_id);
        self.persist_quarantine(&next_quarantine)?;
        state.quarantine = next_quarantine;
        Ok(true)
    }

    pub fn is_quarantined(&self, stable_id: &str) -> bool {
        self.inner.read().quarantine.contains(stable_id)
    }

    pub fn quarantined(&self) -> BTreeSet<String> {
        self.inner.read().quarantine.clone()
    }

    // ---------------------------------------------------------------------
    // Event ring
    // ---------------------------------------------------------------------

    pub fn append_event(&self, event: EventRecord) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let cap = state.config.observability.event_log_size.max(1);
        let mut next = state.events.clone();
        next.push_back(event);
        while next.len() > cap {
            next.pop_front();
        }
        self.persist_events(&next)?;
        state.events = next;
        Ok(())
    }

    /// The `n` most recent events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<EventRecord> {
        self.inner
            .read()
            .events
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn clear_events(&self) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let next = VecDeque::new();
        self.persist_events(&next)?;
        state.events = next;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    pub fn set_maintenance(&self, active: bool) -> Result<MaintenanceFlag, StoreError> {
        let mut state = self.inner.write();
        let next = MaintenanceFlag {
            active,
            activated_at: active.then(Utc::now),
        };
        self.persist_maintenance(&next)?;
        state.maintenance = next;
        Ok(next)
    }

    pub fn maintenance(&self) -> MaintenanceFlag {
        self.inner.read().maintenance
    }

    // ---------------------------------------------------------------------
    // Policy view
    // ---------------------------------------------------------------------

    /// Everything the policy engine needs to know about one stable id,
    /// gathered under a single read lock.
    pub fn container_facts(&self, stable_id: &str, now: DateTime<Utc>) -> ContainerFacts {
        let state = self.inner.read();
        let window = state.config.restart.max_restarts_window_seconds;
        let history = state.history.get(stable_id);
        ContainerFacts {
            maintenance: state.maintenance.active,
            quarantined: state.quarantine.contains(stable_id),
            selected: state.config.monitor.selected.contains(stable_id),
            excluded: state.config.monitor.excluded.contains(stable_id),
            recent_restarts: history.map(|h| h.recent(now, window)).unwrap_or(0),
            last_restart: history.and_then(|h| h.last()),
            total_restarts: history.map(|h| h.total()).unwrap_or(0),
        }
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    fn persist_config(
        &self,
        config: &Config,
        history: &BTreeMap<String, RestartHistory>,
    ) -> Result<(), StoreError> {
        self.write_artifact(
            CONFIG_FILE,
            &ConfigArtifact {
                version: ARTIFACT_VERSION,
                settings: config.clone(),
                restart_history: history.clone(),
            },
        )
    }

    fn persist_events(&self, events: &VecDeque<EventRecord>) -> Result<(), StoreError> {
        self.write_artifact(
            EVENTS_FILE,
            &EventsArtifact {
                version: ARTIFACT_VERSION,
                events: events.iter().cloned().collect(),
            },
        )
    }

    fn persist_quarantine(&self, quarantined: &BTreeSet<String>) -> Result<(), StoreError> {
        self.write_artifact(
            QUARANTINE_FILE,
            &QuarantineArtifact {
                version: ARTIFACT_VERSION,
                quarantined: quarantined.clone(),
            },
        )
    }

    fn persist_maintenance(&self, flag: &MaintenanceFlag) -> Result<(), StoreError> {
        self.write_artifact(
            MAINTENANCE_FILE,
            &MaintenanceArtifact {
                version: ARTIFACT_VERSION,
                flag: *flag,
            },
        )
    }

    fn write_artifact<T: Serialize>(&self, name: &'static str, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|source| StoreError::Encode { artifact: name, source })?;

        let io_err = |source| StoreError::Io { artifact: name, source };

        let mut file = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        file.write_all(&payload).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(self.dir.join(name))
            .map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn load_artifact<T: DeserializeOwned>(dir: &Path, name: &str) -> anyhow::Result<Option<T>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventStatus};

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn event(stable_id: &str, n: u64) -> EventRecord {
        EventRecord::new(
            stable_id,
            stable_id,
            EventKind::Restart,
            EventStatus::Success,
            n,
            format!("restart #{}", n),
        )
    }

    #[test]
    fn test_open_empty_dir_uses_defaults() {
        let (_dir, store) = open_temp();
        let config = store.config();
        assert_eq!(config.monitor.interval_seconds, 30);
        assert!(!store.maintenance().active);
        assert!(store.quarantined().is_empty());
    }

    #[test]
    fn test_restart_history_counts() {
        let (_dir, store) = open_temp();
        let now = Utc::now();

        store.record_restart("svc_a", now - Duration::seconds(120)).unwrap();
        store.record_restart("svc_a", now - Duration::seconds(30)).unwrap();

        assert_eq!(store.count_total("svc_a"), 2);
        assert_eq!(store.count_recent("svc_a", 60, now), 1);
        assert_eq!(store.count_recent("svc_a", 3600, now), 2);
        assert_eq!(store.last_restart("svc_a"), Some(now - Duration::seconds(30)));
        assert_eq!(store.count_total("svc_b"), 0);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = Store::open(dir.path()).unwrap();
            store.record_restart("shop_api", now).unwrap();
            store.quarantine("shop_api").unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.count_total("shop_api"), 1);
        assert!(store.is_quarantined("shop_api"));
    }

    #[test]
    fn test_unquarantine_clears_history() {
        let (_dir, store) = open_temp();
        store.record_restart("svc_a", Utc::now()).unwrap();
        store.quarantine("svc_a").unwrap();

        assert!(store.unquarantine("svc_a").unwrap());
        assert!(!store.is_quarantined("svc_a"));
        assert_eq!(store.count_total("svc_a"), 0);

        // Second removal is a no-op.
        assert!(!store.unquarantine("svc_a").unwrap());
    }

    #[test]
    fn test_quarantine_idempotent() {
        let (_dir, store) = open_temp();
        assert!(store.quarantine("svc_a").unwrap());
        assert!(!store.quarantine("svc_a").unwrap());
    }

    #[test]
    fn test_history_cap_keeps_total_accurate() {
        let mut history = RestartHistory::default();
        let base = Utc::now();
        for i in 0..(HISTORY_CAP + 5) {
            history.record(base + Duration::seconds(i as i64));
        }
        assert_eq!(history.total(), (HISTORY_CAP + 5) as u64);
        assert_eq!(history.timestamps.len(), HISTORY_CAP);
        // Newest timestamps survive.
        assert_eq!(
            history.last(),
            Some(base + Duration::seconds((HISTORY_CAP + 4) as i64))
        );
    }

    #[test]
    fn test_event_ring_evicts_oldest() {
        let (_dir, store) = open_temp();
        let mut observability = store.config().observability.clone();
        observability.event_log_size = crate::config::MIN_EVENT_LOG_SIZE;
        store.put_observability(observability).unwrap();
        let cap = store.config().observability.event_log_size;

        for i in 0..(cap + 3) {
            store.append_event(event("svc_a", i as u64)).unwrap();
        }

        assert_eq!(store.event_count(), cap);
        let recent = store.recent_events(1);
        assert_eq!(recent[0].restart_count, (cap + 2) as u64);
        // The three oldest entries were overwritten.
        let all = store.recent_events(cap + 10);
        assert_eq!(all.last().unwrap().restart_count, 3);
    }

    #[test]
    fn test_recent_events_newest_first() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            store.append_event(event("svc_a", i)).unwrap();
        }
        let recent = store.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].restart_count, 4);
        assert_eq!(recent[2].restart_count, 2);
    }

    #[test]
    fn test_clear_events() {
        let (_dir, store) = open_temp();
        store.append_event(event("svc_a", 0)).unwrap();
        store.clear_events().unwrap();
        assert_eq!(store.event_count(), 0);
    }

    #[test]
    fn test_maintenance_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let flag = store.set_maintenance(true).unwrap();
            assert!(flag.active);
            assert!(flag.activated_at.is_some());
        }
        let store = Store::open(dir.path()).unwrap();
        assert!(store.maintenance().active);

        let flag = store.set_maintenance(false).unwrap();
        assert!(!flag.active);
        assert!(flag.activated_at.is_none());
    }

    #[test]
    fn test_select_idempotent() {
        let (_dir, store) = open_temp();
        assert!(store.select("svc_a").unwrap());
        assert!(!store.select("svc_a").unwrap());
        assert!(store.config().monitor.selected.contains("svc_a"));

        assert!(store.deselect("svc_a").unwrap());
        assert!(!store.deselect("svc_a").unwrap());
    }

    #[test]
    fn test_invalid_config_write_rejected() {
        let (_dir, store) = open_temp();
        let mut restart = RestartConfig::default();
        restart.max_restarts = 100;
        restart.max_restarts_window_seconds = 10;
        let err = store.put_restart(restart).unwrap_err();
        assert!(matches!(err, ConfigWriteError::Policy(_)));
        // Nothing committed.
        assert_eq!(store.config().restart.max_restarts, 3);
    }

    #[test]
    fn test_container_facts_snapshot() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        store.record_restart("svc_a", now - Duration::seconds(10)).unwrap();
        store.select("svc_a").unwrap();

        let facts = store.container_facts("svc_a", now);
        assert!(facts.selected);
        assert!(!facts.quarantined);
        assert_eq!(facts.recent_restarts, 1);
        assert_eq!(facts.total_restarts, 1);
        assert_eq!(facts.last_restart, Some(now - Duration::seconds(10)));
    }
}
