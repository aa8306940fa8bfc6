//! Domain models for the zero-trust policy core
//!
//! Shared types flowing between the identity store, analyst, honeypot
//! pipeline and the traffic orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a device known to the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Profiling,
    Active,
    Revoked,
    Quarantined,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Profiling => "profiling",
            DeviceStatus::Active => "active",
            DeviceStatus::Revoked => "revoked",
            DeviceStatus::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "profiling" => Ok(DeviceStatus::Profiling),
            "active" => Ok(DeviceStatus::Active),
            "revoked" => Ok(DeviceStatus::Revoked),
            "quarantined" => Ok(DeviceStatus::Quarantined),
            _ => Err(format!("Unknown device status: {}", s)),
        }
    }
}

/// Network-layer decision assigned to a device by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Redirect,
    Deny,
    Quarantine,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Redirect => "redirect",
            Decision::Deny => "deny",
            Decision::Quarantine => "quarantine",
        }
    }

    /// Restrictiveness rank; higher means more restrictive.
    pub fn restrictiveness(&self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Redirect => 1,
            Decision::Deny => 2,
            Decision::Quarantine => 3,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Decision::Allow),
            "redirect" => Ok(Decision::Redirect),
            "deny" => Ok(Decision::Deny),
            "quarantine" => Ok(Decision::Quarantine),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// Action carried by a policy or mitigation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    Redirect,
    Monitor,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
            PolicyAction::Redirect => "redirect",
            PolicyAction::Monitor => "monitor",
        }
    }

    /// Tie-break rank at equal rule priority: deny > redirect > monitor > allow.
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            PolicyAction::Deny => 3,
            PolicyAction::Redirect => 2,
            PolicyAction::Monitor => 1,
            PolicyAction::Allow => 0,
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PolicyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(PolicyAction::Allow),
            "deny" => Ok(PolicyAction::Deny),
            "redirect" => Ok(PolicyAction::Redirect),
            "monitor" => Ok(PolicyAction::Monitor),
            _ => Err(format!("Unknown policy action: {}", s)),
        }
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Kinds of alerts raised against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Dos,
    Volume,
    NetworkScan,
    PortScan,
    AttestationFail,
    HoneypotHit,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Dos => "dos",
            AlertKind::Volume => "volume",
            AlertKind::NetworkScan => "network_scan",
            AlertKind::PortScan => "port_scan",
            AlertKind::AttestationFail => "attestation_fail",
            AlertKind::HoneypotHit => "honeypot_hit",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A device row owned by the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub mac: String,
    pub device_type: Option<String>,
    /// SHA-256 over `MAC:type:first_seen`, bound at registration.
    pub fingerprint: String,
    pub cert_path: Option<String>,
    pub status: DeviceStatus,
    pub first_seen: DateTime<Utc>,
    pub onboarded_at: Option<DateTime<Utc>>,
    pub profiling_started_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    /// Devices expected to emit at least one packet per attestation interval.
    pub heartbeat_expected: bool,
}

impl Device {
    /// Compute the physical-identity fingerprint bound at registration.
    pub fn compute_fingerprint(
        mac: &str,
        device_type: Option<&str>,
        first_seen: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mac.as_bytes());
        hasher.update(b":");
        hasher.update(device_type.unwrap_or("unknown").as_bytes());
        hasher.update(b":");
        hasher.update(first_seen.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A device awaiting administrator approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDevice {
    pub device_id: String,
    pub mac: String,
    pub device_type: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Per-device traffic baseline established at the end of profiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub avg_pps: f64,
    pub avg_bps: f64,
    /// Top destination IPs observed during profiling (at most 10).
    pub dst_ips: Vec<String>,
    /// Top destination ports observed during profiling (at most 10).
    pub dst_ports: Vec<u16>,
    pub protocols: Vec<String>,
    /// Fewer than the minimum packet count was observed before finalization.
    pub sparse: bool,
    pub established_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Match predicate for a forwarding rule. Empty fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl RuleMatch {
    pub fn eth_src(mac: impl Into<String>) -> Self {
        Self {
            eth_src: Some(mac.into()),
            ..Self::default()
        }
    }

    pub fn src_ip(ip: impl Into<String>) -> Self {
        Self {
            src_ip: Some(ip.into()),
            ..Self::default()
        }
    }
}

/// One rule in a per-device policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(rename = "match")]
    pub matches: RuleMatch,
    pub action: PolicyAction,
    pub priority: u16,
}

/// Ordered per-device policy; always terminated by a default deny at priority 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub device_id: String,
    pub rules: Vec<PolicyRule>,
    pub generated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// True when the final rule is the required default deny at priority 0.
    pub fn ends_with_default_deny(&self) -> bool {
        self.rules
            .last()
            .map(|r| r.action == PolicyAction::Deny && r.priority == 0)
            .unwrap_or(false)
    }
}

/// Append-only trust history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEvent {
    pub device_id: String,
    pub score_after: i64,
    pub delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Coarse label derived from the current trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Trusted,
    Moderate,
    Suspicious,
    Untrusted,
}

impl TrustLevel {
    pub fn from_score(score: i64) -> Self {
        if score >= 70 {
            TrustLevel::Trusted
        } else if score >= 50 {
            TrustLevel::Moderate
        } else if score >= 30 {
            TrustLevel::Suspicious
        } else {
            TrustLevel::Untrusted
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Moderate => "moderate",
            TrustLevel::Suspicious => "suspicious",
            TrustLevel::Untrusted => "untrusted",
        }
    }
}

/// An immutable alert raised against a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<FlowSample>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        device_id: impl Into<String>,
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            severity,
            message: message.into(),
            observed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_observed(mut self, sample: FlowSample) -> Self {
        self.observed = Some(sample);
        self
    }
}

/// Aggregated per-device counters reported by the switch adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTotals {
    pub mac: String,
    pub packets: u64,
    pub bytes: u64,
    pub dst_ips: Vec<String>,
    pub dst_ports: Vec<u16>,
    pub protocols: Vec<String>,
    pub window_seconds: u64,
}

/// Rate sample derived by the flow poller from two consecutive totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSample {
    pub device_id: String,
    pub mac: String,
    pub pps: f64,
    pub bps: f64,
    pub unique_dst_ips: usize,
    pub unique_dst_ports: usize,
    pub protocols: Vec<String>,
    pub window_seconds: u64,
    pub sampled_at: DateTime<Utc>,
}

/// A single packet summary delivered on the observation channel during profiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketObservation {
    pub mac: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
}

/// Threat intelligence extracted from honeypot logs, keyed by source IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub source_ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_kinds: Vec<String>,
    pub severity: Severity,
}

/// A cross-device forwarding rule derived from confirmed threat intelligence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRule {
    pub rule_id: String,
    pub matches: RuleMatch,
    pub action: PolicyAction,
    pub priority: u16,
    pub reason: String,
    pub origin_threat: String,
    /// Permanent rules survive restarts; others expire with their threat.
    pub permanent: bool,
    pub created_at: DateTime<Utc>,
}

/// One row of the orchestrator's decision audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAudit {
    pub created_at: DateTime<Utc>,
    pub device_id: String,
    pub trust: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<Severity>,
    pub decision: Decision,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_decision: Option<Decision>,
    pub correlation_id: String,
}

/// Topology entry returned by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub device_id: String,
    pub mac: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub current_decision: Option<Decision>,
    /// Revoked and quarantined devices stay listed but never report connected.
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            DeviceStatus::Pending,
            DeviceStatus::Profiling,
            DeviceStatus::Active,
            DeviceStatus::Revoked,
            DeviceStatus::Quarantined,
        ] {
            let parsed: DeviceStatus = status.as_str().parse().expect("status should parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_policy_action_tie_break() {
        assert!(PolicyAction::Deny.tie_break_rank() > PolicyAction::Redirect.tie_break_rank());
        assert!(PolicyAction::Redirect.tie_break_rank() > PolicyAction::Monitor.tie_break_rank());
        assert!(PolicyAction::Monitor.tie_break_rank() > PolicyAction::Allow.tie_break_rank());
    }

    #[test]
    fn test_fingerprint_is_stable_for_same_inputs() {
        let seen = Utc::now();
        let a = Device::compute_fingerprint("aa:bb:cc:00:00:01", Some("sensor"), seen);
        let b = Device::compute_fingerprint("aa:bb:cc:00:00:01", Some("sensor"), seen);
        assert_eq!(a, b);
        let c = Device::compute_fingerprint("aa:bb:cc:00:00:02", Some("sensor"), seen);
        assert_ne!(a, c);
    }

    #[test]
    fn test_default_deny_detection() {
        let policy = Policy {
            device_id: "dev".to_string(),
            rules: vec![
                PolicyRule {
                    matches: RuleMatch {
                        dst_ip: Some("10.0.0.10".to_string()),
                        ..RuleMatch::default()
                    },
                    action: PolicyAction::Allow,
                    priority: 100,
                },
                PolicyRule {
                    matches: RuleMatch::default(),
                    action: PolicyAction::Deny,
                    priority: 0,
                },
            ],
            generated_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(policy.ends_with_default_deny());

        let truncated = Policy {
            rules: policy.rules[..1].to_vec(),
            ..policy
        };
        assert!(!truncated.ends_with_default_deny());
    }
}
