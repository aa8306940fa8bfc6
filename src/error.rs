//! Typed error taxonomy for the policy core
//!
//! Every component boundary returns `CoreError`; the management API maps
//! variants onto HTTP statuses.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias used at component boundaries.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Enumerable reasons an attestation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationReason {
    ExpiredCert,
    UnknownIssuer,
    Revoked,
    SubjectMismatch,
    NotSeen,
    NoHeartbeat,
}

impl AttestationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttestationReason::ExpiredCert => "expired_cert",
            AttestationReason::UnknownIssuer => "unknown_issuer",
            AttestationReason::Revoked => "revoked",
            AttestationReason::SubjectMismatch => "subject_mismatch",
            AttestationReason::NotSeen => "not_seen",
            AttestationReason::NoHeartbeat => "no_heartbeat",
        }
    }
}

impl std::fmt::Display for AttestationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("MAC address already registered to a non-revoked device")]
    DuplicateMac,

    #[error("device id already in use")]
    DuplicateDeviceId,

    #[error("attestation failed: {reason}")]
    AttestationFailed { reason: AttestationReason },

    #[error("switch unavailable")]
    SwitchUnavailable,

    #[error("switch rejected rule: {reason}")]
    SwitchRuleRejected { reason: String },

    #[error("storage error: {cause}")]
    Storage { cause: String },

    #[error("config error for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("transient failure: {cause}")]
    Transient { cause: String },

    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        CoreError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn storage(cause: impl std::fmt::Display) -> Self {
        CoreError::Storage {
            cause: cause.to_string(),
        }
    }

    pub fn transient(cause: impl std::fmt::Display) -> Self {
        CoreError::Transient {
            cause: cause.to_string(),
        }
    }

    /// Machine-readable kind tag surfaced by the management API.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "not_found",
            CoreError::Conflict { .. } => "conflict",
            CoreError::DuplicateMac => "duplicate_mac",
            CoreError::DuplicateDeviceId => "duplicate_device_id",
            CoreError::AttestationFailed { .. } => "attestation_failed",
            CoreError::SwitchUnavailable => "switch_unavailable",
            CoreError::SwitchRuleRejected { .. } => "switch_rule_rejected",
            CoreError::Storage { .. } => "storage_error",
            CoreError::Config { .. } => "config_error",
            CoreError::Transient { .. } => "transient",
            CoreError::PolicyViolation(_) => "policy_violation",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage {
            cause: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Storage {
            cause: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Storage {
            cause: format!("serialization: {}", err),
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict { .. }
            | CoreError::DuplicateMac
            | CoreError::DuplicateDeviceId => StatusCode::CONFLICT,
            CoreError::AttestationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::PolicyViolation(_) => StatusCode::FORBIDDEN,
            CoreError::Config { .. } => StatusCode::BAD_REQUEST,
            CoreError::SwitchUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::SwitchRuleRejected { .. }
            | CoreError::Storage { .. }
            | CoreError::Transient { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}
