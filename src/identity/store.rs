//! Identity store
//!
//! The single owner of device, baseline, policy and trust rows. All
//! state-changing operations are atomic per device: writers for the same
//! device serialize on a per-device lock, and no operation ever takes two
//! device locks at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::database::{queries, Database};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Baseline, DecisionAudit, Device, DeviceStatus, MitigationRule, PendingDevice, Policy,
    Threat, TrustEvent,
};

/// Device type tags whose members are expected to emit heartbeat traffic.
const HEARTBEAT_DEVICE_TYPES: &[&str] = &["sensor", "camera", "thermostat"];

/// Registry of per-device write locks. Locks are created on first use and
/// never dropped; the device population is small by design.
#[derive(Default)]
pub struct DeviceLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceLocks {
    pub fn lock_for(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("device lock registry poisoned");
        Arc::clone(
            locks
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

/// Durable identity state behind a typed interface.
pub struct IdentityStore {
    db: Database,
    locks: Arc<DeviceLocks>,
}

fn db_err(err: anyhow::Error) -> CoreError {
    CoreError::storage(err)
}

impl IdentityStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(DeviceLocks::default()),
        }
    }

    /// The per-device lock registry, shared with the trust scorer so both
    /// serialize on the same locks.
    pub fn locks(&self) -> Arc<DeviceLocks> {
        Arc::clone(&self.locks)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> anyhow::Result<T>,
    ) -> CoreResult<T> {
        self.db.with(f).map_err(db_err)
    }

    // ── Registration and lifecycle ──────────────────────────────────────

    /// Register a newly discovered device as pending approval.
    ///
    /// The device id is the administrator's suggestion when given,
    /// otherwise derived from the MAC prefix plus a random suffix.
    pub async fn register_pending(
        &self,
        mac: &str,
        suggested_device_id: Option<&str>,
        device_type: Option<&str>,
    ) -> CoreResult<String> {
        let mac = normalize_mac(mac);

        let in_use = self.with_conn(|conn| {
            Ok(queries::mac_live_exists(conn, &mac)? || queries::pending_mac_exists(conn, &mac)?)
        })?;
        if in_use {
            return Err(CoreError::DuplicateMac);
        }

        let device_id = match suggested_device_id {
            Some(id) => id.to_string(),
            None => generate_device_id(&mac),
        };
        if self.with_conn(|conn| queries::device_id_exists(conn, &device_id))? {
            return Err(CoreError::DuplicateDeviceId);
        }

        let pending = PendingDevice {
            device_id: device_id.clone(),
            mac: mac.clone(),
            device_type: device_type.map(str::to_string),
            requested_at: Utc::now(),
        };
        self.with_conn(|conn| queries::insert_pending(conn, &pending))?;

        info!("[IDENTITY] Registered pending device {} ({})", device_id, mac);
        Ok(device_id)
    }

    pub async fn list_pending(&self) -> CoreResult<Vec<PendingDevice>> {
        self.with_conn(queries::list_pending)
    }

    /// Approve a pending device: creates its device row in `profiling`
    /// state. Certificate issuance and rule installation are the
    /// onboarding coordinator's follow-up.
    pub async fn approve(&self, device_id: &str, admin_note: &str) -> CoreResult<Device> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let pending = self
            .with_conn(|conn| queries::get_pending(conn, device_id))?
            .ok_or_else(|| CoreError::not_found("pending_device", device_id))?;

        let now = Utc::now();
        let heartbeat_expected = pending
            .device_type
            .as_deref()
            .map(|t| HEARTBEAT_DEVICE_TYPES.contains(&t))
            .unwrap_or(false);
        let device = Device {
            device_id: pending.device_id.clone(),
            mac: pending.mac.clone(),
            device_type: pending.device_type.clone(),
            fingerprint: Device::compute_fingerprint(
                &pending.mac,
                pending.device_type.as_deref(),
                now,
            ),
            cert_path: None,
            status: DeviceStatus::Profiling,
            first_seen: now,
            onboarded_at: Some(now),
            profiling_started_at: None,
            last_seen: None,
            last_ip: None,
            heartbeat_expected,
        };

        self.with_conn(|conn| {
            queries::insert_device(conn, &device)?;
            queries::delete_pending(conn, device_id)?;
            Ok(())
        })?;

        info!(
            "[IDENTITY] Approved device {} ({}): {}",
            device_id, device.mac, admin_note
        );
        Ok(device)
    }

    /// Reject a pending device. The row moves to `devices` as revoked so
    /// the MAC stays auditable; no certificate is ever issued.
    pub async fn reject(&self, device_id: &str, admin_note: &str) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let pending = self
            .with_conn(|conn| queries::get_pending(conn, device_id))?
            .ok_or_else(|| CoreError::not_found("pending_device", device_id))?;

        let now = Utc::now();
        let device = Device {
            device_id: pending.device_id.clone(),
            mac: pending.mac.clone(),
            device_type: pending.device_type.clone(),
            fingerprint: Device::compute_fingerprint(
                &pending.mac,
                pending.device_type.as_deref(),
                now,
            ),
            cert_path: None,
            status: DeviceStatus::Revoked,
            first_seen: now,
            onboarded_at: None,
            profiling_started_at: None,
            last_seen: None,
            last_ip: None,
            heartbeat_expected: false,
        };

        self.with_conn(|conn| {
            queries::insert_device(conn, &device)?;
            queries::delete_pending(conn, device_id)?;
            Ok(())
        })?;

        info!("[IDENTITY] Rejected device {}: {}", device_id, admin_note);
        Ok(())
    }

    /// Undo an approval whose certificate issuance failed: the device row
    /// is removed and the pending entry restored.
    pub async fn return_to_pending(&self, device: &Device) -> CoreResult<()> {
        let lock = self.locks.lock_for(&device.device_id);
        let _guard = lock.lock().await;

        let pending = PendingDevice {
            device_id: device.device_id.clone(),
            mac: device.mac.clone(),
            device_type: device.device_type.clone(),
            requested_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM devices WHERE device_id = ?1",
                rusqlite::params![device.device_id],
            )?;
            queries::insert_pending(conn, &pending)?;
            Ok(())
        })?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> CoreResult<Device> {
        self.with_conn(|conn| queries::get_device(conn, device_id))?
            .ok_or_else(|| CoreError::not_found("device", device_id))
    }

    pub async fn find_device(&self, device_id: &str) -> CoreResult<Option<Device>> {
        self.with_conn(|conn| queries::get_device(conn, device_id))
    }

    pub async fn get_device_by_mac(&self, mac: &str) -> CoreResult<Option<Device>> {
        let mac = normalize_mac(mac);
        self.with_conn(|conn| queries::get_device_by_mac(conn, &mac))
    }

    pub async fn list_devices(&self) -> CoreResult<Vec<Device>> {
        self.with_conn(queries::list_devices)
    }

    pub async fn list_devices_with_status(
        &self,
        status: DeviceStatus,
    ) -> CoreResult<Vec<Device>> {
        self.with_conn(|conn| queries::list_devices_with_status(conn, status))
    }

    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let changed = self.with_conn(|conn| queries::set_status(conn, device_id, status))?;
        if !changed {
            return Err(CoreError::not_found("device", device_id));
        }
        Ok(())
    }

    pub async fn set_last_seen(
        &self,
        device_id: &str,
        seen_at: DateTime<Utc>,
        last_ip: Option<&str>,
    ) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;
        self.with_conn(|conn| queries::set_last_seen(conn, device_id, seen_at, last_ip))?;
        Ok(())
    }

    pub async fn set_cert_path(&self, device_id: &str, cert_path: &str) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;
        self.with_conn(|conn| queries::set_cert_path(conn, device_id, cert_path))?;
        Ok(())
    }

    pub async fn set_profiling_started(
        &self,
        device_id: &str,
        started_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;
        self.with_conn(|conn| queries::set_profiling_started(conn, device_id, started_at))?;
        Ok(())
    }

    /// Atomically revoke a device: flips status and destroys its baseline
    /// and policy. The caller is responsible for certificate revocation
    /// and for re-entering the orchestrator.
    pub async fn revoke_device(&self, device_id: &str) -> CoreResult<Device> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let device = self
            .with_conn(|conn| queries::get_device(conn, device_id))?
            .ok_or_else(|| CoreError::not_found("device", device_id))?;
        if device.status == DeviceStatus::Revoked {
            return Err(CoreError::conflict("device already revoked"));
        }

        self.with_conn(|conn| {
            queries::set_status(conn, device_id, DeviceStatus::Revoked)?;
            queries::delete_baseline(conn, device_id)?;
            queries::delete_policy(conn, device_id)?;
            Ok(())
        })?;

        info!("[IDENTITY] Revoked device {}", device_id);
        Ok(Device {
            status: DeviceStatus::Revoked,
            ..device
        })
    }

    // ── Baselines and policies ──────────────────────────────────────────

    pub async fn put_baseline(&self, device_id: &str, baseline: &Baseline) -> CoreResult<()> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;
        self.with_conn(|conn| queries::put_baseline(conn, device_id, baseline))
    }

    pub async fn get_baseline(&self, device_id: &str) -> CoreResult<Option<Baseline>> {
        self.with_conn(|conn| queries::get_baseline(conn, device_id))
    }

    pub async fn put_policy(&self, policy: &Policy) -> CoreResult<()> {
        let lock = self.locks.lock_for(&policy.device_id);
        let _guard = lock.lock().await;
        self.with_conn(|conn| queries::put_policy(conn, policy))
    }

    pub async fn get_policy(&self, device_id: &str) -> CoreResult<Option<Policy>> {
        self.with_conn(|conn| queries::get_policy(conn, device_id))
    }

    // ── Trust history ───────────────────────────────────────────────────

    /// Append one trust event. Callers hold the device lock through the
    /// trust scorer; this method does not re-lock.
    pub fn append_trust_event(&self, event: &TrustEvent) -> CoreResult<()> {
        self.with_conn(|conn| queries::append_trust_event(conn, event))
    }

    pub fn current_trust(&self, device_id: &str) -> CoreResult<Option<i64>> {
        self.with_conn(|conn| queries::latest_trust(conn, device_id))
    }

    pub fn trust_history(&self, device_id: &str, limit: usize) -> CoreResult<Vec<TrustEvent>> {
        self.with_conn(|conn| queries::trust_history(conn, device_id, limit))
    }

    // ── Decision audit ──────────────────────────────────────────────────

    pub fn append_audit(&self, audit: &DecisionAudit) -> CoreResult<()> {
        self.with_conn(|conn| queries::insert_audit(conn, audit))
    }

    pub fn audit_since(&self, since: DateTime<Utc>) -> CoreResult<Vec<DecisionAudit>> {
        self.with_conn(|conn| queries::list_audit_since(conn, since))
    }

    // ── Threat intelligence ─────────────────────────────────────────────

    pub fn upsert_threat(&self, threat: &Threat) -> CoreResult<()> {
        self.with_conn(|conn| queries::upsert_threat(conn, threat))
    }

    pub fn get_threat(&self, source_ip: &str) -> CoreResult<Option<Threat>> {
        self.with_conn(|conn| queries::get_threat(conn, source_ip))
    }

    pub fn list_threats(&self) -> CoreResult<Vec<Threat>> {
        self.with_conn(queries::list_threats)
    }

    pub fn purge_stale_threats(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<String>> {
        self.with_conn(|conn| queries::purge_stale_threats(conn, cutoff))
    }

    // ── Mitigation rules ────────────────────────────────────────────────

    pub fn upsert_mitigation(&self, rule: &MitigationRule) -> CoreResult<()> {
        self.with_conn(|conn| queries::upsert_mitigation(conn, rule))
    }

    pub fn list_mitigations(&self) -> CoreResult<Vec<MitigationRule>> {
        self.with_conn(queries::list_mitigations)
    }

    pub fn delete_mitigation(&self, rule_id: &str) -> CoreResult<()> {
        self.with_conn(|conn| queries::delete_mitigation(conn, rule_id))?;
        Ok(())
    }

    pub fn expire_rules_for_origin(&self, origin: &str) -> CoreResult<Vec<String>> {
        self.with_conn(|conn| queries::expire_rules_for_origin(conn, origin))
    }
}

fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

fn generate_device_id(mac: &str) -> String {
    let prefix: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).take(6).collect();
    format!("dev-{}-{:04x}", prefix, rand::random::<u16>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn store() -> IdentityStore {
        IdentityStore::new(Database::in_memory().expect("db"))
    }

    #[tokio::test]
    async fn test_register_approve_lifecycle() {
        let store = store();
        let device_id = store
            .register_pending("AA:BB:CC:00:00:01", Some("d-1"), Some("sensor"))
            .await
            .expect("register");
        assert_eq!(device_id, "d-1");

        let pending = store.list_pending().await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mac, "aa:bb:cc:00:00:01");

        let device = store.approve("d-1", "looks legit").await.expect("approve");
        assert_eq!(device.status, DeviceStatus::Profiling);
        assert!(device.heartbeat_expected, "sensors expect heartbeats");
        assert!(store.list_pending().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_mac_rejected_until_revoked() {
        let store = store();
        store
            .register_pending("aa:bb:cc:00:00:01", Some("d-1"), None)
            .await
            .expect("register");

        let err = store
            .register_pending("aa:bb:cc:00:00:01", Some("d-2"), None)
            .await
            .expect_err("duplicate must fail");
        assert_eq!(err.kind(), "duplicate_mac");

        // After rejection the MAC is free again.
        store.reject("d-1", "unknown vendor").await.expect("reject");
        store
            .register_pending("aa:bb:cc:00:00:01", Some("d-2"), None)
            .await
            .expect("MAC released by revocation");
    }

    #[tokio::test]
    async fn test_generated_ids_carry_mac_prefix() {
        let store = store();
        let device_id = store
            .register_pending("aa:bb:cc:00:00:07", None, None)
            .await
            .expect("register");
        assert!(device_id.starts_with("dev-aabbcc-"), "got {}", device_id);
    }

    #[tokio::test]
    async fn test_revoke_destroys_baseline_and_policy() {
        let store = store();
        store
            .register_pending("aa:bb:cc:00:00:01", Some("d-1"), None)
            .await
            .expect("register");
        store.approve("d-1", "ok").await.expect("approve");

        let now = Utc::now();
        store
            .put_baseline(
                "d-1",
                &Baseline {
                    avg_pps: 1.0,
                    avg_bps: 100.0,
                    dst_ips: vec!["10.0.0.10".to_string()],
                    dst_ports: vec![443],
                    protocols: vec!["tcp".to_string()],
                    sparse: false,
                    established_at: now,
                    updated_at: now,
                },
            )
            .await
            .expect("baseline");

        let device = store.revoke_device("d-1").await.expect("revoke");
        assert_eq!(device.status, DeviceStatus::Revoked);
        assert!(store.get_baseline("d-1").await.expect("query").is_none());
        assert!(store.get_policy("d-1").await.expect("query").is_none());

        let err = store.revoke_device("d-1").await.expect_err("double revoke");
        assert_eq!(err.kind(), "conflict");
    }
}
