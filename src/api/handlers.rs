//! Management API handlers

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{TimeZone, Utc};

use crate::api::models::*;
use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::honeypot::HoneypotIngestor;
use crate::identity::{CertificateAuthority, IdentityStore, OnboardingCoordinator};
use crate::models::{DecisionAudit, Device, DeviceStatus, PendingDevice, TopologyEntry, Threat, TrustEvent, TrustLevel};
use crate::orchestrator::TrafficOrchestrator;
use crate::trust::TrustScorer;

pub struct AppState {
    pub store: Arc<IdentityStore>,
    pub scorer: Arc<TrustScorer>,
    pub ca: Arc<CertificateAuthority>,
    pub coordinator: Arc<OnboardingCoordinator>,
    pub orchestrator: Arc<TrafficOrchestrator>,
    pub ingestor: Arc<HoneypotIngestor>,
    pub bus: EventBus,
    pub config: Arc<CoreConfig>,
}

impl AppState {
    fn device_view(&self, device: Device) -> DeviceView {
        let trust = self.scorer.get(&device.device_id);
        DeviceView {
            trust,
            trust_level: trust.map(TrustLevel::from_score),
            current_decision: self.orchestrator.last_installed(&device.device_id),
            device_id: device.device_id,
            mac: device.mac,
            device_type: device.device_type,
            status: device.status,
            fingerprint: device.fingerprint,
            first_seen: device.first_seen,
            last_seen: device.last_seen,
            last_ip: device.last_ip,
        }
    }
}

pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> CoreResult<Json<RegisterResponse>> {
    let device_id = state
        .store
        .register_pending(
            &request.mac,
            request.device_id.as_deref(),
            request.device_type.as_deref(),
        )
        .await?;
    Ok(Json(RegisterResponse { device_id }))
}

pub async fn list_pending_devices(
    State(state): State<Arc<AppState>>,
) -> CoreResult<Json<Vec<PendingDevice>>> {
    Ok(Json(state.store.list_pending().await?))
}

pub async fn approve_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<AdminNote>,
) -> CoreResult<Json<DeviceView>> {
    let note = body.note.unwrap_or_default();
    let device = state.coordinator.approve(&device_id, &note).await?;
    Ok(Json(state.device_view(device)))
}

pub async fn reject_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<AdminNote>,
) -> CoreResult<Json<()>> {
    let note = body.note.unwrap_or_default();
    state.coordinator.reject(&device_id, &note).await?;
    Ok(Json(()))
}

pub async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> CoreResult<Json<Vec<DeviceView>>> {
    let devices = state.store.list_devices().await?;
    Ok(Json(
        devices
            .into_iter()
            .map(|d| state.device_view(d))
            .collect(),
    ))
}

pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<DeviceView>> {
    let device = state.store.get_device(&device_id).await?;
    Ok(Json(state.device_view(device)))
}

pub async fn revoke_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<DeviceView>> {
    let device = state.store.revoke_device(&device_id).await?;

    // Revoking the device revokes its credential. Devices rejected
    // before issuance have no certificate to revoke.
    match state.ca.revoke(&device_id, "device revoked") {
        Ok(()) => {}
        Err(CoreError::NotFound { .. }) => {}
        Err(err) => return Err(err),
    }

    state.bus.publish(crate::bus::CoreEvent::DeviceStatusChanged {
        device_id: device_id.clone(),
        status: DeviceStatus::Revoked,
    });
    // Drive the data-plane change synchronously so the caller observes it.
    state.orchestrator.reevaluate(&device_id, "revoked").await?;
    Ok(Json(state.device_view(device)))
}

pub async fn release_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<()>> {
    state.orchestrator.release_quarantine(&device_id).await?;
    Ok(Json(()))
}

pub async fn get_trust_score(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<TrustView>> {
    state.store.get_device(&device_id).await?;
    let score = state
        .scorer
        .get(&device_id)
        .ok_or_else(|| CoreError::not_found("trust_score", &device_id))?;
    Ok(Json(TrustView {
        device_id,
        score,
        level: TrustLevel::from_score(score),
    }))
}

pub async fn get_trust_history(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<Vec<TrustEvent>>> {
    state.store.get_device(&device_id).await?;
    Ok(Json(state.store.trust_history(&device_id, 100)?))
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<PolicyView>> {
    state.store.get_device(&device_id).await?;
    Ok(Json(PolicyView {
        policy: state.store.get_policy(&device_id).await?,
        device_id,
    }))
}

pub async fn get_baseline(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<BaselineView>> {
    state.store.get_device(&device_id).await?;
    Ok(Json(BaselineView {
        baseline: state.store.get_baseline(&device_id).await?,
        device_id,
    }))
}

pub async fn finalize_onboarding(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> CoreResult<Json<BaselineView>> {
    let baseline = state.coordinator.finalize(&device_id).await?;
    Ok(Json(BaselineView {
        baseline: Some(baseline),
        device_id,
    }))
}

pub async fn get_decisions_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> CoreResult<Json<Vec<DecisionAudit>>> {
    let since = match query.since {
        Some(ts) => Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| CoreError::conflict(format!("invalid since timestamp {}", ts)))?,
        None => Utc::now() - chrono::Duration::hours(24),
    };
    Ok(Json(state.store.audit_since(since)?))
}

pub async fn list_threats(
    State(state): State<Arc<AppState>>,
) -> CoreResult<Json<Vec<Threat>>> {
    Ok(Json(state.store.list_threats()?))
}

/// Topology listing. Revoked and quarantined devices stay visible but
/// are never reported as connected.
pub async fn get_topology(
    State(state): State<Arc<AppState>>,
) -> CoreResult<Json<Vec<TopologyEntry>>> {
    let devices = state.store.list_devices().await?;
    let entries = devices
        .into_iter()
        .map(|device| {
            let current_decision = state.orchestrator.last_installed(&device.device_id);
            let connected = matches!(
                device.status,
                DeviceStatus::Profiling | DeviceStatus::Active
            ) && device.last_seen.is_some();
            TopologyEntry {
                device_id: device.device_id,
                mac: device.mac,
                status: device.status,
                last_seen: device.last_seen,
                current_decision,
                connected,
            }
        })
        .collect();
    Ok(Json(entries))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> CoreResult<Json<StatusView>> {
    let devices = state.store.list_devices().await?;
    let pending = state.store.list_pending().await?;
    let threats = state.store.list_threats()?;
    let mitigations = state.store.list_mitigations()?;

    Ok(Json(StatusView {
        devices: devices.len(),
        pending_devices: pending.len(),
        threats: threats.len(),
        mitigation_rules: mitigations.len(),
        dropped_events: state.bus.dropped_events(),
        honeypot_events: state.ingestor.events_ingested(),
        capabilities: Capabilities {
            switch_connected: true,
            honeypot_configured: state.config.honeypot_port.is_some(),
            positive_tick: state.config.positive_tick_enabled,
        },
    }))
}
