//! Attestation loop
//!
//! Periodically re-verifies every active device: certificate validity,
//! recent liveness, and heartbeat activity where expected. The three
//! checks pass or fail together; any failure costs trust. A broken
//! identity binding quarantines the device outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::{AttestationReason, CoreResult};
use crate::identity::ca::{CertificateAuthority, ValidationOutcome};
use crate::identity::store::IdentityStore;
use crate::models::{Alert, AlertKind, Device, DeviceStatus, Severity};
use crate::trust::TrustScorer;

pub struct AttestationLoop {
    store: Arc<IdentityStore>,
    ca: Arc<CertificateAuthority>,
    scorer: Arc<TrustScorer>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    running: Arc<AtomicBool>,
}

impl AttestationLoop {
    pub fn new(
        store: Arc<IdentityStore>,
        ca: Arc<CertificateAuthority>,
        scorer: Arc<TrustScorer>,
        bus: EventBus,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            ca,
            scorer,
            bus,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let attestation = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "[ATTEST] Attestation loop started (interval: {}s)",
                attestation.config.attestation_interval_s
            );
            while attestation.running.load(Ordering::SeqCst) {
                for _ in 0..attestation.config.attestation_interval_s {
                    if !attestation.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                if !attestation.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = attestation.attest_all().await {
                    error!("[ATTEST] Attestation cycle failed: {}", err);
                }
            }
            info!("[ATTEST] Attestation loop stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One full attestation cycle over all active devices.
    pub async fn attest_all(&self) -> CoreResult<usize> {
        let devices = self
            .store
            .list_devices_with_status(DeviceStatus::Active)
            .await?;
        let mut failures = 0usize;

        for device in devices {
            match self.attest_device(&device).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    failures += 1;
                    self.handle_failure(&device, reason).await?;
                }
                Err(err) => {
                    error!("[ATTEST] Attestation errored for {}: {}", device.device_id, err);
                }
            }
        }
        Ok(failures)
    }

    /// Run the three checks; returns the first failing reason.
    async fn attest_device(&self, device: &Device) -> CoreResult<Option<AttestationReason>> {
        // (a) Certificate validity.
        match self.ca.validate_device_file(&device.device_id)? {
            ValidationOutcome::Valid => {}
            ValidationOutcome::Invalid(reason) => return Ok(Some(reason)),
        }

        // (b) Seen within twice the attestation interval.
        let liveness_window =
            chrono::Duration::seconds(2 * self.config.attestation_interval_s as i64);
        match device.last_seen {
            Some(last_seen) if Utc::now() - last_seen <= liveness_window => {}
            Some(_) | None => return Ok(Some(AttestationReason::NotSeen)),
        }

        // (c) Heartbeat devices must have emitted traffic this interval.
        if device.heartbeat_expected {
            let heartbeat_window =
                chrono::Duration::seconds(self.config.attestation_interval_s as i64);
            let heard = device
                .last_seen
                .map(|seen| Utc::now() - seen <= heartbeat_window)
                .unwrap_or(false);
            if !heard {
                return Ok(Some(AttestationReason::NoHeartbeat));
            }
        }

        Ok(None)
    }

    async fn handle_failure(
        &self,
        device: &Device,
        reason: AttestationReason,
    ) -> CoreResult<()> {
        warn!(
            "[ATTEST] Attestation failed for {}: {}",
            device.device_id, reason
        );

        self.scorer
            .record_attestation_failure(&device.device_id, reason.as_str())
            .await?;

        // The failure itself re-enters the orchestrator through the trust
        // delta; the alert carries the reason for audit and operators.
        self.bus.publish(CoreEvent::AlertRaised(Alert::new(
            device.device_id.clone(),
            AlertKind::AttestationFail,
            Severity::Low,
            format!("attestation failed: {}", reason),
        )));

        // A broken subject binding means the credential no longer matches
        // the physical identity; that is a hard fail.
        if reason == AttestationReason::SubjectMismatch {
            self.store
                .set_status(&device.device_id, DeviceStatus::Quarantined)
                .await?;
            self.bus.publish(CoreEvent::DeviceStatusChanged {
                device_id: device.device_id.clone(),
                status: DeviceStatus::Quarantined,
            });
        }

        Ok(())
    }
}
