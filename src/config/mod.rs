use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration write that would make the restart policy incoherent
/// (most importantly: one that makes quarantine unreachable). Rejected at
/// the management boundary with the offending field named.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{field}: {message}")]
pub struct PolicyViolation {
    pub field: &'static str,
    pub message: String,
}

impl PolicyViolation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub uptime: UptimeConfig,
    /// Unknown top-level sections survive a load/store round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            monitor: MonitorConfig::default(),
            restart: RestartConfig::default(),
            observability: ObservabilityConfig::default(),
            uptime: UptimeConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), PolicyViolation> {
        self.monitor.validate()?;
        self.restart.validate(self.monitor.interval_seconds)?;
        self.observability.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            management_port: default_management_port(),
            metrics_port: default_metrics_port(),
            docker_socket: default_docker_socket(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_management_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which containers the loop watches and how often it looks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitoring passes (default: 30)
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Label that opts a container into monitoring (default: monitoring.enable)
    #[serde(default = "default_label_key")]
    pub label_key: String,
    #[serde(default = "default_label_value")]
    pub label_value: String,
    /// Monitor every container regardless of labels (default: false)
    #[serde(default)]
    pub include_all: bool,
    /// Stable ids explicitly selected for monitoring
    #[serde(default)]
    pub selected: std::collections::BTreeSet<String>,
    /// Stable ids never monitored, even when labeled or selected
    #[serde(default)]
    pub excluded: std::collections::BTreeSet<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            label_key: default_label_key(),
            label_value: default_label_value(),
            include_all: false,
            selected: Default::default(),
            excluded: Default::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), PolicyViolation> {
        if self.interval_seconds < 1 {
            return Err(PolicyViolation::new(
                "monitor.interval_seconds",
                "must be at least 1",
            ));
        }
        if self.label_key.is_empty() {
            return Err(PolicyViolation::new(
                "monitor.label_key",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

fn default_interval() -> u64 {
    30
}

fn default_label_key() -> String {
    "monitoring.enable".to_string()
}

fn default_label_value() -> String {
    "true".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Restart on non-zero exit only
    OnFailure,
    /// Restart on failed healthcheck only
    Health,
    /// Restart on either signal
    Both,
}

impl RestartMode {
    pub fn covers_health(&self) -> bool {
        matches!(self, RestartMode::Health | RestartMode::Both)
    }

    pub fn covers_exit(&self) -> bool {
        matches!(self, RestartMode::OnFailure | RestartMode::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_mode")]
    pub mode: RestartMode,
    /// Minimum spacing between consecutive restarts of one workload (default: 60)
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    /// Restarts allowed inside the rate window before quarantine (default: 3)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Rate window length in seconds (default: 3600)
    #[serde(default = "default_window")]
    pub max_restarts_window_seconds: u64,
    /// Leave containers alone when they exited cleanly (default: true)
    #[serde(default = "default_respect_manual_stop")]
    pub respect_manual_stop: bool,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Grace given to the container process on stop (default: 10)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            cooldown_seconds: default_cooldown(),
            max_restarts: default_max_restarts(),
            max_restarts_window_seconds: default_window(),
            respect_manual_stop: default_respect_manual_stop(),
            backoff: BackoffConfig::default(),
            stop_timeout_seconds: default_stop_timeout(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_mode() -> RestartMode {
    RestartMode::Both
}

fn default_cooldown() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    3
}

fn default_window() -> u64 {
    3600
}

fn default_respect_manual_stop() -> bool {
    true
}

fn default_stop_timeout() -> u64 {
    10
}

impl RestartConfig {
    /// Check that quarantine stays reachable under this policy: the rate
    /// window must be able to contain `max_restarts` restarts given the
    /// cooldown, the monitor cadence, and (when enabled) the backoff terms.
    pub fn validate(&self, monitor_interval_seconds: u64) -> Result<(), PolicyViolation> {
        if self.max_restarts < 1 {
            return Err(PolicyViolation::new(
                "restart.max_restarts",
                "must be at least 1",
            ));
        }
        if self.max_restarts_window_seconds < 1 {
            return Err(PolicyViolation::new(
                "restart.max_restarts_window_seconds",
                "must be at least 1",
            ));
        }

        let spacing = self.cooldown_seconds.max(monitor_interval_seconds);
        let floor = u64::from(self.max_restarts).saturating_mul(spacing);
        if self.max_restarts_window_seconds < floor {
            return Err(PolicyViolation::new(
                "restart.max_restarts_window_seconds",
                format!(
                    "window of {}s cannot hold {} restarts spaced {}s apart (needs at least {}s)",
                    self.max_restarts_window_seconds, self.max_restarts, spacing, floor
                ),
            ));
        }

        if self.backoff.enabled {
            if self.backoff.multiplier < 1.0 {
                return Err(PolicyViolation::new(
                    "restart.backoff.multiplier",
                    "must be at least 1.0",
                ));
            }
            let backoff_total: u64 = (0..self.max_restarts)
                .map(|k| self.backoff.delay_seconds(k as usize))
                .sum();
            let cooldown_total =
                u64::from(self.max_restarts).saturating_mul(self.cooldown_seconds);
            let needed = backoff_total.saturating_add(cooldown_total);
            if needed > self.max_restarts_window_seconds {
                return Err(PolicyViolation::new(
                    "restart.backoff",
                    format!(
                        "cooldowns plus backoff delays total {}s, exceeding the {}s rate window; quarantine would be unreachable",
                        needed, self.max_restarts_window_seconds
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backoff_initial")]
    pub initial_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max")]
    pub max_seconds: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_seconds: default_backoff_initial(),
            multiplier: default_backoff_multiplier(),
            max_seconds: default_backoff_max(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_backoff_initial() -> u64 {
    10
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> u64 {
    300
}

impl BackoffConfig {
    /// Delay added on top of the cooldown after `recent` restarts in the
    /// current window: `min(initial * multiplier^recent, max)`.
    pub fn delay_seconds(&self, recent: usize) -> u64 {
        let raw = self.initial_seconds as f64 * self.multiplier.powi(recent as i32);
        if !raw.is_finite() || raw >= self.max_seconds as f64 {
            self.max_seconds
        } else {
            raw as u64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Entries kept in the durable event ring (default: 1000, minimum: 500)
    #[serde(default = "default_event_log_size")]
    pub event_log_size: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            event_log_size: default_event_log_size(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_event_log_size() -> usize {
    1000
}

pub const MIN_EVENT_LOG_SIZE: usize = 500;

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<(), PolicyViolation> {
        if self.event_log_size < MIN_EVENT_LOG_SIZE {
            return Err(PolicyViolation::new(
                "observability.event_log_size",
                format!("must be at least {}", MIN_EVENT_LOG_SIZE),
            ));
        }
        Ok(())
    }
}

/// External uptime monitor integration (Uptime-Kuma compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    /// API key, sent as an X-Api-Key header when set
    #[serde(default)]
    pub api_key: Option<String>,
    /// Basic credentials, used when no API key is set
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Restart mapped containers when their monitor goes DOWN (default: true)
    #[serde(default = "default_auto_restart_on_down")]
    pub auto_restart_on_down: bool,
    /// monitor friendly name -> stable container id
    #[serde(default)]
    pub mappings: std::collections::BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for UptimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: None,
            username: None,
            password: None,
            auto_restart_on_down: default_auto_restart_on_down(),
            mappings: Default::default(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_auto_restart_on_down() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn test_window_too_small_rejected() {
        let mut config = RestartConfig::default();
        config.max_restarts = 5;
        config.cooldown_seconds = 60;
        config.max_restarts_window_seconds = 120;
        let err = config.validate(30).unwrap_err();
        assert_eq!(err.field, "restart.max_restarts_window_seconds");
    }

    #[test]
    fn test_window_floor_uses_monitor_interval() {
        // Cooldown is tiny, but the loop only looks every 120s, so the
        // window must hold max_restarts * 120s.
        let mut config = RestartConfig::default();
        config.max_restarts = 3;
        config.cooldown_seconds = 1;
        config.max_restarts_window_seconds = 200;
        assert!(config.validate(120).is_err());
        assert!(config.validate(30).is_ok());
    }

    #[test]
    fn test_backoff_overflowing_window_rejected() {
        let mut config = RestartConfig::default();
        config.max_restarts = 4;
        config.cooldown_seconds = 30;
        config.max_restarts_window_seconds = 300;
        config.backoff.enabled = true;
        config.backoff.initial_seconds = 60;
        config.backoff.multiplier = 2.0;
        config.backoff.max_seconds = 600;
        // 60 + 120 + 240 + 480 (capped later) + 4*30 > 300
        let err = config.validate(30).unwrap_err();
        assert_eq!(err.field, "restart.backoff");
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let backoff = BackoffConfig {
            enabled: true,
            initial_seconds: 5,
            multiplier: 2.0,
            max_seconds: 30,
            extra: serde_json::Map::new(),
        };
        assert_eq!(backoff.delay_seconds(0), 5);
        assert_eq!(backoff.delay_seconds(1), 10);
        assert_eq!(backoff.delay_seconds(2), 20);
        assert_eq!(backoff.delay_seconds(3), 30);
        assert_eq!(backoff.delay_seconds(10), 30);
    }

    #[test]
    fn test_multiplier_below_one_rejected() {
        let mut config = RestartConfig::default();
        config.backoff.enabled = true;
        config.backoff.multiplier = 0.5;
        let err = config.validate(30).unwrap_err();
        assert_eq!(err.field, "restart.backoff.multiplier");
    }

    #[test]
    fn test_event_log_floor() {
        let mut config = ObservabilityConfig::default();
        config.event_log_size = 100;
        assert!(config.validate().is_err());
        config.event_log_size = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = serde_json::json!({
            "monitor": { "interval_seconds": 15, "future_knob": "kept" },
            "experimental": { "flag": true }
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.monitor.interval_seconds, 15);

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["monitor"]["future_knob"], "kept");
        assert_eq!(out["experimental"]["flag"], true);
    }

    #[test]
    fn test_restart_mode_wire_format() {
        let mode: RestartMode = serde_json::from_str("\"on-failure\"").unwrap();
        assert_eq!(mode, RestartMode::OnFailure);
        assert_eq!(serde_json::to_string(&RestartMode::Both).unwrap(), "\"both\"");
    }
}
