//! Runtime configuration for the policy core
//!
//! Loaded from a JSON file, then overridden by `TRUSTPLANE_*` environment
//! variables, then validated. Validation failures abort startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const DEFAULT_INITIAL_TRUST: i64 = 70;
const DEFAULT_ATTESTATION_INTERVAL_S: u64 = 300;
const DEFAULT_FLOW_POLL_INTERVAL_S: u64 = 10;
const DEFAULT_ANOMALY_WINDOW_S: u64 = 60;
const DEFAULT_PROFILING_DURATION_S: u64 = 300;
const DEFAULT_PROFILING_MIN_PACKETS: u64 = 5;
const DEFAULT_BASELINE_EMA_ALPHA: f64 = 0.1;
const DEFAULT_THREAT_TTL_S: u64 = 86_400;
const DEFAULT_TRUST_THRESHOLDS: [i64; 3] = [70, 50, 30];
const DEFAULT_TRUST_HYSTERESIS: i64 = 5;
const DEFAULT_ALERT_WINDOW_S: u64 = 300;
const DEFAULT_RECOVERY_WINDOW_S: u64 = 600;
const DEFAULT_EVENT_QUEUE_SIZE: usize = 1024;
const DEFAULT_RULE_INSTALL_RETRIES: u32 = 3;
const DEFAULT_API_LISTEN: &str = "127.0.0.1:8440";

fn default_initial_trust() -> i64 {
    DEFAULT_INITIAL_TRUST
}
fn default_attestation_interval() -> u64 {
    DEFAULT_ATTESTATION_INTERVAL_S
}
fn default_flow_poll_interval() -> u64 {
    DEFAULT_FLOW_POLL_INTERVAL_S
}
fn default_anomaly_window() -> u64 {
    DEFAULT_ANOMALY_WINDOW_S
}
fn default_profiling_duration() -> u64 {
    DEFAULT_PROFILING_DURATION_S
}
fn default_profiling_min_packets() -> u64 {
    DEFAULT_PROFILING_MIN_PACKETS
}
fn default_baseline_ema_alpha() -> f64 {
    DEFAULT_BASELINE_EMA_ALPHA
}
fn default_threat_ttl() -> u64 {
    DEFAULT_THREAT_TTL_S
}
fn default_trust_thresholds() -> Vec<i64> {
    DEFAULT_TRUST_THRESHOLDS.to_vec()
}
fn default_trust_hysteresis() -> i64 {
    DEFAULT_TRUST_HYSTERESIS
}
fn default_alert_window() -> u64 {
    DEFAULT_ALERT_WINDOW_S
}
fn default_recovery_window() -> u64 {
    DEFAULT_RECOVERY_WINDOW_S
}
fn default_event_queue_size() -> usize {
    DEFAULT_EVENT_QUEUE_SIZE
}
fn default_rule_install_retries() -> u32 {
    DEFAULT_RULE_INSTALL_RETRIES
}
fn default_api_listen() -> String {
    DEFAULT_API_LISTEN.to_string()
}

/// Full runtime configuration. One instance, constructed at startup,
/// shared read-only by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_initial_trust")]
    pub initial_trust_score: i64,
    #[serde(default = "default_attestation_interval")]
    pub attestation_interval_s: u64,
    #[serde(default = "default_flow_poll_interval")]
    pub flow_poll_interval_s: u64,
    #[serde(default = "default_anomaly_window")]
    pub anomaly_window_s: u64,
    #[serde(default = "default_profiling_duration")]
    pub profiling_duration_s: u64,
    #[serde(default = "default_profiling_min_packets")]
    pub profiling_min_packets: u64,
    #[serde(default = "default_baseline_ema_alpha")]
    pub baseline_ema_alpha: f64,
    /// Switch output port for honeypot redirects. Required when any
    /// redirect decision or mitigation can be issued.
    #[serde(default)]
    pub honeypot_port: Option<u32>,
    /// Optional isolation port used by quarantine rules.
    #[serde(default)]
    pub quarantine_port: Option<u32>,
    pub honeypot_log_path: Option<PathBuf>,
    #[serde(default = "default_threat_ttl")]
    pub threat_ttl_s: u64,
    #[serde(default = "default_trust_thresholds")]
    pub trust_thresholds: Vec<i64>,
    #[serde(default = "default_trust_hysteresis")]
    pub trust_hysteresis: i64,
    #[serde(default = "default_alert_window")]
    pub alert_window_s: u64,
    #[serde(default = "default_recovery_window")]
    pub recovery_window_s: u64,
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    #[serde(default = "default_rule_install_retries")]
    pub rule_install_retries: u32,
    /// Hourly +2 drift for uneventful devices. Off unless enabled.
    #[serde(default)]
    pub positive_tick_enabled: bool,
    pub db_path: Option<PathBuf>,
    pub ca_dir: Option<PathBuf>,
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            initial_trust_score: DEFAULT_INITIAL_TRUST,
            attestation_interval_s: DEFAULT_ATTESTATION_INTERVAL_S,
            flow_poll_interval_s: DEFAULT_FLOW_POLL_INTERVAL_S,
            anomaly_window_s: DEFAULT_ANOMALY_WINDOW_S,
            profiling_duration_s: DEFAULT_PROFILING_DURATION_S,
            profiling_min_packets: DEFAULT_PROFILING_MIN_PACKETS,
            baseline_ema_alpha: DEFAULT_BASELINE_EMA_ALPHA,
            honeypot_port: None,
            quarantine_port: None,
            honeypot_log_path: None,
            threat_ttl_s: DEFAULT_THREAT_TTL_S,
            trust_thresholds: DEFAULT_TRUST_THRESHOLDS.to_vec(),
            trust_hysteresis: DEFAULT_TRUST_HYSTERESIS,
            alert_window_s: DEFAULT_ALERT_WINDOW_S,
            recovery_window_s: DEFAULT_RECOVERY_WINDOW_S,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            rule_install_retries: DEFAULT_RULE_INSTALL_RETRIES,
            positive_tick_enabled: false,
            db_path: None,
            ca_dir: None,
            api_listen: DEFAULT_API_LISTEN.to_string(),
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::Config {
            key: "config_file",
            reason: format!("{}: {}", path.display(), e),
        })?;
        let mut config: CoreConfig =
            serde_json::from_str(&raw).map_err(|e| CoreError::Config {
                key: "config_file",
                reason: format!("invalid JSON: {}", e),
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults plus environment only (no file). Used by tests
    /// and by `init-db` when no config file exists yet.
    pub fn from_env() -> CoreResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse_i64("TRUSTPLANE_INITIAL_TRUST_SCORE", 0, 100) {
            self.initial_trust_score = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_ATTESTATION_INTERVAL_S", 1, 86_400) {
            self.attestation_interval_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_FLOW_POLL_INTERVAL_S", 1, 3_600) {
            self.flow_poll_interval_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_ANOMALY_WINDOW_S", 1, 3_600) {
            self.anomaly_window_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_PROFILING_DURATION_S", 1, 86_400) {
            self.profiling_duration_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_PROFILING_MIN_PACKETS", 1, 1_000_000) {
            self.profiling_min_packets = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_THREAT_TTL_S", 60, 30 * 86_400) {
            self.threat_ttl_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_ALERT_WINDOW_S", 1, 86_400) {
            self.alert_window_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_RECOVERY_WINDOW_S", 1, 86_400) {
            self.recovery_window_s = v;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_EVENT_QUEUE_SIZE", 16, 1 << 20) {
            self.event_queue_size = v as usize;
        }
        if let Some(v) = env_parse_u64("TRUSTPLANE_HONEYPOT_PORT", 1, u32::MAX as u64) {
            self.honeypot_port = Some(v as u32);
        }
        if let Some(v) = env_parse_bool("TRUSTPLANE_POSITIVE_TICK") {
            self.positive_tick_enabled = v;
        }
        if let Some(v) = env_var("TRUSTPLANE_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("TRUSTPLANE_CA_DIR") {
            self.ca_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("TRUSTPLANE_HONEYPOT_LOG_PATH") {
            self.honeypot_log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("TRUSTPLANE_API_LISTEN") {
            self.api_listen = v;
        }
    }

    /// Check required keys and value ranges. Errors here are fatal.
    pub fn validate(&self) -> CoreResult<()> {
        if self.db_path.is_none() {
            return Err(CoreError::Config {
                key: "db_path",
                reason: "required".to_string(),
            });
        }
        if self.ca_dir.is_none() {
            return Err(CoreError::Config {
                key: "ca_dir",
                reason: "required".to_string(),
            });
        }
        if self.honeypot_log_path.is_none() {
            return Err(CoreError::Config {
                key: "honeypot_log_path",
                reason: "required".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.baseline_ema_alpha) {
            return Err(CoreError::Config {
                key: "baseline_ema_alpha",
                reason: format!("{} outside [0,1]", self.baseline_ema_alpha),
            });
        }
        if !(0..=100).contains(&self.initial_trust_score) {
            return Err(CoreError::Config {
                key: "initial_trust_score",
                reason: format!("{} outside [0,100]", self.initial_trust_score),
            });
        }
        if self.trust_thresholds.len() != 3 {
            return Err(CoreError::Config {
                key: "trust_thresholds",
                reason: "expected exactly three thresholds".to_string(),
            });
        }
        if self
            .trust_thresholds
            .windows(2)
            .any(|w| w[0] <= w[1])
        {
            return Err(CoreError::Config {
                key: "trust_thresholds",
                reason: "must be strictly descending".to_string(),
            });
        }
        if self.event_queue_size == 0 {
            return Err(CoreError::Config {
                key: "event_queue_size",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_deref().expect("validated config has db_path")
    }

    pub fn ca_dir(&self) -> &Path {
        self.ca_dir.as_deref().expect("validated config has ca_dir")
    }

    pub fn attestation_interval(&self) -> Duration {
        Duration::from_secs(self.attestation_interval_s)
    }

    pub fn flow_poll_interval(&self) -> Duration {
        Duration::from_secs(self.flow_poll_interval_s)
    }

    pub fn profiling_duration(&self) -> Duration {
        Duration::from_secs(self.profiling_duration_s)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse_bool(name: &str) -> Option<bool> {
    env_var(name).map(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_parse_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    env_var(name)
        .and_then(|v| v.parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
}

fn env_parse_i64(name: &str, min: i64, max: i64) -> Option<i64> {
    env_var(name)
        .and_then(|v| v.parse::<i64>().ok())
        .map(|v| v.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> CoreConfig {
        CoreConfig {
            db_path: Some(PathBuf::from(":memory:")),
            ca_dir: Some(PathBuf::from("/tmp/ca")),
            honeypot_log_path: Some(PathBuf::from("/tmp/cowrie.json")),
            ..CoreConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.initial_trust_score, 70);
        assert_eq!(config.attestation_interval_s, 300);
        assert_eq!(config.flow_poll_interval_s, 10);
        assert_eq!(config.profiling_duration_s, 300);
        assert_eq!(config.profiling_min_packets, 5);
        assert_eq!(config.trust_thresholds, vec![70, 50, 30]);
        assert_eq!(config.trust_hysteresis, 5);
        assert_eq!(config.event_queue_size, 1024);
        assert!(!config.positive_tick_enabled);
    }

    #[test]
    fn test_validate_requires_paths() {
        let err = CoreConfig::default().validate().expect_err("must fail");
        assert_eq!(err.kind(), "config_error");

        populated().validate().expect("populated config should pass");
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = populated();
        config.baseline_ema_alpha = 1.5;
        let err = config.validate().expect_err("alpha out of range");
        assert!(err.to_string().contains("baseline_ema_alpha"));
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = populated();
        config.trust_thresholds = vec![50, 70, 30];
        assert!(config.validate().is_err());
    }
}
