//! Restart policy.
//!
//! `decide` is a pure function: container snapshot + durable facts +
//! configuration in, decision out. Nothing here touches the runtime, the
//! clock or the store, which is what makes the gnarly cooldown/backoff/
//! quarantine matrix testable.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::config::{MonitorConfig, RestartConfig};
use crate::runtime::{ContainerSnapshot, ContainerStatus, HealthStatus};

/// Durable state about one stable id, as gathered by the store under a
/// single lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerFacts {
    pub maintenance: bool,
    pub quarantined: bool,
    pub selected: bool,
    pub excluded: bool,
    pub recent_restarts: usize,
    pub last_restart: Option<DateTime<Utc>>,
    pub total_restarts: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    Observe,
    Restart { delay: Duration },
    Quarantine(QuarantineReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Maintenance,
    NotMonitored,
    Quarantined,
    ManualStop,
    Cooldown { remaining: Duration },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Maintenance => write!(f, "maintenance"),
            SkipReason::NotMonitored => write!(f, "not-monitored"),
            SkipReason::Quarantined => write!(f, "quarantined"),
            SkipReason::ManualStop => write!(f, "manual-stop"),
            SkipReason::Cooldown { remaining } => {
                write!(f, "cooldown ({}s remaining)", remaining.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuarantineReason {
    RateExceeded { recent: usize, max: u32 },
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::RateExceeded { recent, max } => {
                write!(f, "rate-exceeded ({} restarts in window, limit {})", recent, max)
            }
        }
    }
}

/// Membership rule for the monitored set. Exclusion always wins.
pub fn is_monitored(
    snapshot: &ContainerSnapshot,
    monitor: &MonitorConfig,
    facts: &ContainerFacts,
) -> bool {
    if facts.excluded {
        return false;
    }
    monitor.include_all
        || facts.selected
        || snapshot.labels.get(&monitor.label_key) == Some(&monitor.label_value)
}

pub fn decide(
    snapshot: &ContainerSnapshot,
    monitor: &MonitorConfig,
    restart: &RestartConfig,
    facts: &ContainerFacts,
    now: DateTime<Utc>,
) -> Decision {
    if facts.maintenance {
        return Decision::Skip(SkipReason::Maintenance);
    }

    if !is_monitored(snapshot, monitor, facts) {
        return Decision::Skip(SkipReason::NotMonitored);
    }

    if facts.quarantined {
        return Decision::Skip(SkipReason::Quarantined);
    }

    match snapshot.status {
        ContainerStatus::Running => {
            // A failed healthcheck is the only restart signal for a running
            // container; none/starting/healthy are all fine.
            if !(snapshot.health == HealthStatus::Unhealthy && restart.mode.covers_health()) {
                return Decision::Observe;
            }
        }
        ContainerStatus::Exited => {
            let exit_code = snapshot.exit_code.unwrap_or(0);
            if exit_code == 0 && restart.respect_manual_stop {
                return Decision::Skip(SkipReason::ManualStop);
            }
            if !restart.mode.covers_exit() {
                return Decision::Observe;
            }
        }
        // Operator-driven or transient states; leave them alone.
        ContainerStatus::Paused
        | ContainerStatus::Created
        | ContainerStatus::Restarting
        | ContainerStatus::Dead => return Decision::Observe,
    }

    if facts.recent_restarts >= restart.max_restarts as usize {
        return Decision::Quarantine(QuarantineReason::RateExceeded {
            recent: facts.recent_restarts,
            max: restart.max_restarts,
        });
    }

    let mut spacing_ms = restart.cooldown_seconds.saturating_mul(1000);
    if restart.backoff.enabled {
        let backoff_ms = restart
            .backoff
            .delay_seconds(facts.recent_restarts)
            .saturating_mul(1000);
        spacing_ms = spacing_ms.saturating_add(backoff_ms);
    }

    if let Some(last) = facts.last_restart {
        let elapsed_ms = (now - last).num_milliseconds();
        if elapsed_ms < spacing_ms as i64 {
            let remaining = (spacing_ms as i64 - elapsed_ms).max(0) as u64;
            return Decision::Skip(SkipReason::Cooldown {
                remaining: Duration::from_millis(remaining),
            });
        }
    }

    Decision::Restart {
        delay: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartMode;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn snapshot(status: ContainerStatus, health: HealthStatus) -> ContainerSnapshot {
        ContainerSnapshot {
            runtime_id: "abc123".to_string(),
            name: "svc_a".to_string(),
            image: "example:latest".to_string(),
            status,
            exit_code: None,
            health,
            labels: HashMap::new(),
            started_at: None,
        }
    }

    fn exited(exit_code: i64) -> ContainerSnapshot {
        let mut s = snapshot(ContainerStatus::Exited, HealthStatus::None);
        s.exit_code = Some(exit_code);
        s
    }

    fn monitored_facts() -> ContainerFacts {
        ContainerFacts {
            selected: true,
            ..Default::default()
        }
    }

    fn restart_config(mode: RestartMode, cooldown: u64, max: u32, window: u64) -> RestartConfig {
        let mut config = RestartConfig::default();
        config.mode = mode;
        config.cooldown_seconds = cooldown;
        config.max_restarts = max;
        config.max_restarts_window_seconds = window;
        config
    }

    fn decide_now(
        s: &ContainerSnapshot,
        restart: &RestartConfig,
        facts: &ContainerFacts,
    ) -> Decision {
        decide(s, &MonitorConfig::default(), restart, facts, Utc::now())
    }

    #[test]
    fn test_unhealthy_running_restarts() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let config = restart_config(RestartMode::Health, 10, 3, 60);
        let decision = decide_now(&s, &config, &monitored_facts());
        assert_eq!(decision, Decision::Restart { delay: Duration::ZERO });
    }

    #[test]
    fn test_cooldown_blocks_second_restart() {
        // Scenario: restarted 5s ago, cooldown is 10s.
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let config = restart_config(RestartMode::Health, 10, 3, 60);
        let mut facts = monitored_facts();
        facts.recent_restarts = 1;
        let now = Utc::now();
        facts.last_restart = Some(now - ChronoDuration::seconds(5));

        match decide(&s, &MonitorConfig::default(), &config, &facts, now) {
            Decision::Skip(SkipReason::Cooldown { remaining }) => {
                assert_eq!(remaining.as_secs(), 5);
            }
            other => panic!("expected cooldown skip, got {:?}", other),
        }
    }

    #[test]
    fn test_quarantine_after_burst() {
        // Scenario: three restarts already inside the window, limit 3.
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let config = restart_config(RestartMode::Health, 1, 3, 60);
        let mut facts = monitored_facts();
        facts.recent_restarts = 3;
        facts.last_restart = Some(Utc::now() - ChronoDuration::seconds(2));

        let decision = decide_now(&s, &config, &facts);
        assert_eq!(
            decision,
            Decision::Quarantine(QuarantineReason::RateExceeded { recent: 3, max: 3 })
        );
    }

    #[test]
    fn test_manual_stop_respected() {
        let config = restart_config(RestartMode::OnFailure, 10, 3, 60);
        let decision = decide_now(&exited(0), &config, &monitored_facts());
        assert_eq!(decision, Decision::Skip(SkipReason::ManualStop));
    }

    #[test]
    fn test_clean_exit_restarted_when_protection_off() {
        let mut config = restart_config(RestartMode::OnFailure, 10, 3, 60);
        config.respect_manual_stop = false;
        let decision = decide_now(&exited(0), &config, &monitored_facts());
        assert_eq!(decision, Decision::Restart { delay: Duration::ZERO });
    }

    #[test]
    fn test_crash_exit_restarts() {
        let config = restart_config(RestartMode::OnFailure, 0, 3, 60);
        let decision = decide_now(&exited(137), &config, &monitored_facts());
        assert_eq!(decision, Decision::Restart { delay: Duration::ZERO });
    }

    #[test]
    fn test_mode_gates_signals() {
        // Health failures are ignored in on-failure mode.
        let unhealthy = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let on_failure = restart_config(RestartMode::OnFailure, 0, 3, 60);
        assert_eq!(decide_now(&unhealthy, &on_failure, &monitored_facts()), Decision::Observe);

        // Crash exits are ignored in health mode.
        let health_only = restart_config(RestartMode::Health, 0, 3, 60);
        assert_eq!(decide_now(&exited(1), &health_only, &monitored_facts()), Decision::Observe);

        // Both mode covers both.
        let both = restart_config(RestartMode::Both, 0, 3, 60);
        assert_eq!(
            decide_now(&unhealthy, &both, &monitored_facts()),
            Decision::Restart { delay: Duration::ZERO }
        );
        assert_eq!(
            decide_now(&exited(1), &both, &monitored_facts()),
            Decision::Restart { delay: Duration::ZERO }
        );
    }

    #[test]
    fn test_benign_states_observed() {
        let config = RestartConfig::default();
        for (status, health) in [
            (ContainerStatus::Running, HealthStatus::Healthy),
            (ContainerStatus::Running, HealthStatus::None),
            (ContainerStatus::Running, HealthStatus::Starting),
            (ContainerStatus::Paused, HealthStatus::None),
            (ContainerStatus::Created, HealthStatus::None),
            (ContainerStatus::Restarting, HealthStatus::None),
            (ContainerStatus::Dead, HealthStatus::None),
        ] {
            let decision = decide_now(&snapshot(status, health), &config, &monitored_facts());
            assert_eq!(decision, Decision::Observe, "{:?}/{:?}", status, health);
        }
    }

    #[test]
    fn test_maintenance_wins_over_everything() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let mut facts = monitored_facts();
        facts.maintenance = true;
        facts.quarantined = true;
        let decision = decide_now(&s, &RestartConfig::default(), &facts);
        assert_eq!(decision, Decision::Skip(SkipReason::Maintenance));
    }

    #[test]
    fn test_quarantined_id_skipped() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let mut facts = monitored_facts();
        facts.quarantined = true;
        let decision = decide_now(&s, &RestartConfig::default(), &facts);
        assert_eq!(decision, Decision::Skip(SkipReason::Quarantined));
    }

    #[test]
    fn test_unmonitored_skipped() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let decision = decide_now(&s, &RestartConfig::default(), &ContainerFacts::default());
        assert_eq!(decision, Decision::Skip(SkipReason::NotMonitored));
    }

    #[test]
    fn test_label_opts_in() {
        let monitor = MonitorConfig::default();
        let mut s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        s.labels
            .insert(monitor.label_key.clone(), monitor.label_value.clone());
        let decision = decide(
            &s,
            &monitor,
            &restart_config(RestartMode::Both, 0, 3, 60),
            &ContainerFacts::default(),
            Utc::now(),
        );
        assert_eq!(decision, Decision::Restart { delay: Duration::ZERO });
    }

    #[test]
    fn test_exclusion_beats_include_all() {
        let mut monitor = MonitorConfig::default();
        monitor.include_all = true;
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let mut facts = monitored_facts();
        facts.excluded = true;
        let decision = decide(&s, &monitor, &RestartConfig::default(), &facts, Utc::now());
        assert_eq!(decision, Decision::Skip(SkipReason::NotMonitored));
    }

    #[test]
    fn test_backoff_extends_spacing() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let mut config = restart_config(RestartMode::Health, 10, 5, 600);
        config.backoff.enabled = true;
        config.backoff.initial_seconds = 5;
        config.backoff.multiplier = 2.0;
        config.backoff.max_seconds = 300;

        // Two recent restarts: spacing = 10 + 5 * 2^2 = 30s.
        let mut facts = monitored_facts();
        facts.recent_restarts = 2;
        let now = Utc::now();
        facts.last_restart = Some(now - ChronoDuration::seconds(25));

        match decide(&s, &MonitorConfig::default(), &config, &facts, now) {
            Decision::Skip(SkipReason::Cooldown { remaining }) => {
                assert_eq!(remaining.as_secs(), 5);
            }
            other => panic!("expected cooldown skip, got {:?}", other),
        }

        // After the full spacing has elapsed the restart goes through.
        facts.last_restart = Some(now - ChronoDuration::seconds(31));
        let decision = decide(&s, &MonitorConfig::default(), &config, &facts, now);
        assert_eq!(decision, Decision::Restart { delay: Duration::ZERO });
    }

    #[test]
    fn test_decision_is_deterministic() {
        let s = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy);
        let config = restart_config(RestartMode::Both, 30, 3, 600);
        let now = Utc::now();
        let mut facts = monitored_facts();
        facts.recent_restarts = 1;
        facts.last_restart = Some(now - ChronoDuration::seconds(10));

        let first = decide(&s, &MonitorConfig::default(), &config, &facts, now);
        let second = decide(&s, &MonitorConfig::default(), &config, &facts, now);
        assert_eq!(first, second);
    }
}
