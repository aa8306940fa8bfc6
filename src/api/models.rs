//! Request and response bodies for the management API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Baseline, DeviceStatus, Decision, Policy, TrustLevel};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminNote {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub mac: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub device_id: String,
}

/// Device row plus live evaluation state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub mac: String,
    pub device_type: Option<String>,
    pub status: DeviceStatus,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub trust: Option<i64>,
    pub trust_level: Option<TrustLevel>,
    pub current_decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustView {
    pub device_id: String,
    pub score: i64,
    pub level: TrustLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyView {
    pub device_id: String,
    pub policy: Option<Policy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaselineView {
    pub device_id: String,
    pub baseline: Option<Baseline>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    /// Unix seconds; defaults to the last 24 hours.
    #[serde(default)]
    pub since: Option<i64>,
}

/// Aggregate framework status for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub devices: usize,
    pub pending_devices: usize,
    pub threats: usize,
    pub mitigation_rules: usize,
    pub dropped_events: u64,
    pub honeypot_events: u64,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub switch_connected: bool,
    pub honeypot_configured: bool,
    pub positive_tick: bool,
}
