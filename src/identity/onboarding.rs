//! Onboarding coordinator
//!
//! Drives the enrollment state machine. Approval issues a certificate,
//! binds the physical identity, opens a permissive observation window,
//! and seeds the trust score. When the profiling window elapses the
//! accumulated traffic becomes a baseline and a least-privilege policy.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::identity::ca::CertificateAuthority;
use crate::identity::store::IdentityStore;
use crate::models::{
    Baseline, Device, DeviceStatus, PacketObservation, Policy, PolicyAction, PolicyRule,
    RuleMatch,
};
use crate::switch::{RuleAction, RuleSpec, SwitchControl};
use crate::trust::TrustScorer;

/// Priority of the permissive rule installed for the profiling window.
const OBSERVATION_RULE_PRIORITY: u16 = 10;
/// Backoff bounds for observation-rule installs.
const RULE_RETRY_INITIAL: Duration = Duration::from_secs(1);
const RULE_RETRY_CAP: Duration = Duration::from_secs(30);
const RULE_RETRY_ATTEMPTS: u32 = 5;
/// Watcher cadence for elapsed profiling windows.
const FINALIZE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Cap on baseline top-N destination lists.
const BASELINE_TOP_N: usize = 10;

#[derive(Debug, Default)]
struct ProfilingAccum {
    packets: u64,
    bytes: u64,
    dst_ips: HashMap<String, u64>,
    dst_ports: HashMap<u16, u64>,
    protocols: BTreeSet<String>,
}

/// Coordinates device enrollment from approval through finalization.
pub struct OnboardingCoordinator {
    store: Arc<IdentityStore>,
    ca: Arc<CertificateAuthority>,
    scorer: Arc<TrustScorer>,
    switch: Arc<dyn SwitchControl>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    /// Live accumulation for profiling devices, keyed by MAC.
    profiling: Arc<StdMutex<HashMap<String, ProfilingAccum>>>,
    watcher_running: Arc<AtomicBool>,
}

impl OnboardingCoordinator {
    pub fn new(
        store: Arc<IdentityStore>,
        ca: Arc<CertificateAuthority>,
        scorer: Arc<TrustScorer>,
        switch: Arc<dyn SwitchControl>,
        bus: EventBus,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            ca,
            scorer,
            switch,
            bus,
            config,
            profiling: Arc::new(StdMutex::new(HashMap::new())),
            watcher_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hook the profiling accumulator into the switch's observation
    /// channel. Call once at startup.
    pub fn attach_observer(&self) {
        let profiling = Arc::clone(&self.profiling);
        self.switch.record_observation(Arc::new(move |obs: PacketObservation| {
            let mut accums = profiling.lock().expect("profiling accumulator poisoned");
            if let Some(accum) = accums.get_mut(&obs.mac) {
                accum.packets += 1;
                accum.bytes += obs.size;
                if let Some(ip) = &obs.dst_ip {
                    *accum.dst_ips.entry(ip.clone()).or_insert(0) += 1;
                }
                if let Some(port) = obs.dst_port {
                    *accum.dst_ports.entry(port).or_insert(0) += 1;
                }
                accum.protocols.insert(obs.protocol.clone());
            }
        }));
    }

    /// Approve a pending device and open its profiling window.
    pub async fn approve(&self, device_id: &str, admin_note: &str) -> CoreResult<Device> {
        let device = self.store.approve(device_id, admin_note).await?;

        // Certificate issuance failure aborts onboarding; the device
        // returns to the approval queue.
        let (cert_path, _key_path) = match self.ca.issue(&device.device_id, &device.mac) {
            Ok(paths) => paths,
            Err(err) => {
                error!(
                    "[ONBOARD] Certificate issuance failed for {}: {}",
                    device_id, err
                );
                self.store.return_to_pending(&device).await?;
                self.bus.publish(CoreEvent::DeviceStatusChanged {
                    device_id: device_id.to_string(),
                    status: DeviceStatus::Pending,
                });
                return Err(err);
            }
        };
        self.store
            .set_cert_path(&device.device_id, &cert_path.to_string_lossy())
            .await?;

        self.scorer.initialize(&device.device_id).await?;

        // Observation rule install retries surface as an operator alert
        // but do not abort an otherwise valid enrollment: the window
        // still runs and finalizes sparse if no traffic is mirrored.
        if let Err(err) = self.install_observation_rule(&device).await {
            error!(
                "[ONBOARD] Observation rule unavailable for {}: {}",
                device.device_id, err
            );
        }

        let started = Utc::now();
        self.store
            .set_profiling_started(&device.device_id, started)
            .await?;
        {
            let mut accums = self.profiling.lock().expect("profiling accumulator poisoned");
            accums.insert(device.mac.clone(), ProfilingAccum::default());
        }

        self.bus.publish(CoreEvent::DeviceStatusChanged {
            device_id: device.device_id.clone(),
            status: DeviceStatus::Profiling,
        });

        info!(
            "[ONBOARD] {} profiling for {}s (min {} packets)",
            device.device_id, self.config.profiling_duration_s, self.config.profiling_min_packets
        );
        Ok(device)
    }

    /// Reject a pending device; no certificate, no profiling.
    pub async fn reject(&self, device_id: &str, admin_note: &str) -> CoreResult<()> {
        self.store.reject(device_id, admin_note).await?;
        self.bus.publish(CoreEvent::DeviceStatusChanged {
            device_id: device_id.to_string(),
            status: DeviceStatus::Revoked,
        });
        Ok(())
    }

    async fn install_observation_rule(&self, device: &Device) -> CoreResult<()> {
        let rule = RuleSpec {
            rule_id: format!("obs-{}", device.device_id),
            matches: RuleMatch::eth_src(device.mac.clone()),
            action: RuleAction::Forward,
            priority: OBSERVATION_RULE_PRIORITY,
        };

        let mut delay = RULE_RETRY_INITIAL;
        for attempt in 1..=RULE_RETRY_ATTEMPTS {
            match self.switch.install_rule(rule.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RULE_RETRY_ATTEMPTS => {
                    warn!(
                        "[ONBOARD] Observation rule install attempt {} failed for {}: {}",
                        attempt, device.device_id, err
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RULE_RETRY_CAP);
                }
                Err(err) => {
                    error!(
                        "[ONBOARD] Observation rule install exhausted retries for {}",
                        device.device_id
                    );
                    return Err(err);
                }
            }
        }
        unreachable!("retry loop returns on success or final error")
    }

    /// Finalize an elapsed (or explicitly finalized) profiling window:
    /// compute the baseline, derive the least-privilege policy, activate
    /// the device.
    pub async fn finalize(&self, device_id: &str) -> CoreResult<Baseline> {
        let device = self.store.get_device(device_id).await?;
        if device.status != DeviceStatus::Profiling {
            return Err(CoreError::conflict(format!(
                "device {} is {}, not profiling",
                device_id, device.status
            )));
        }

        let accum = {
            let mut accums = self.profiling.lock().expect("profiling accumulator poisoned");
            accums.remove(&device.mac).unwrap_or_default()
        };

        let started = device.profiling_started_at.unwrap_or(device.first_seen);
        let baseline = compute_baseline(
            &accum,
            started,
            Utc::now(),
            self.config.profiling_min_packets,
        );
        self.store.put_baseline(device_id, &baseline).await?;

        let policy = least_privilege_policy(device_id, &baseline);
        self.store.put_policy(&policy).await?;

        self.store.set_status(device_id, DeviceStatus::Active).await?;

        // The observation rule gives way to the enforced policy, which
        // the orchestrator installs on the status change.
        if let Err(err) = self
            .switch
            .remove_rule(&format!("obs-{}", device_id))
            .await
        {
            warn!(
                "[ONBOARD] Failed to remove observation rule for {}: {}",
                device_id, err
            );
        }

        self.bus.publish(CoreEvent::PolicyReplaced {
            device_id: device_id.to_string(),
        });
        self.bus.publish(CoreEvent::DeviceStatusChanged {
            device_id: device_id.to_string(),
            status: DeviceStatus::Active,
        });

        info!(
            "[ONBOARD] Finalized {}: {} allow rules, sparse={}",
            device_id,
            policy.rules.len().saturating_sub(1),
            baseline.sparse
        );
        Ok(baseline)
    }

    /// Background watcher finalizing any device whose window elapsed.
    /// Crash-safe: works from the persisted `profiling_started_at`, so a
    /// restart mid-window still finalizes on schedule.
    pub fn spawn_finalization_watcher(self: &Arc<Self>) {
        if self.watcher_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            info!("[ONBOARD] Finalization watcher started");
            while coordinator.watcher_running.load(Ordering::SeqCst) {
                if let Err(err) = coordinator.finalize_elapsed().await {
                    error!("[ONBOARD] Finalization sweep failed: {}", err);
                }
                for _ in 0..FINALIZE_CHECK_INTERVAL.as_secs() {
                    if !coordinator.watcher_running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            info!("[ONBOARD] Finalization watcher stopped");
        });
    }

    pub fn stop_watcher(&self) {
        self.watcher_running.store(false, Ordering::SeqCst);
    }

    async fn finalize_elapsed(&self) -> CoreResult<()> {
        let profiling = self
            .store
            .list_devices_with_status(DeviceStatus::Profiling)
            .await?;
        let window = chrono::Duration::seconds(self.config.profiling_duration_s as i64);
        let now = Utc::now();

        for device in profiling {
            let started = device.profiling_started_at.unwrap_or(device.first_seen);
            if now - started >= window {
                if let Err(err) = self.finalize(&device.device_id).await {
                    error!(
                        "[ONBOARD] Auto-finalization failed for {}: {}",
                        device.device_id, err
                    );
                }
            }
        }
        Ok(())
    }
}

fn compute_baseline(
    accum: &ProfilingAccum,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
    min_packets: u64,
) -> Baseline {
    let elapsed = (ended - started).num_seconds().max(1) as f64;

    let mut top_ips: Vec<(String, u64)> = accum
        .dst_ips
        .iter()
        .map(|(ip, count)| (ip.clone(), *count))
        .collect();
    top_ips.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_ips.truncate(BASELINE_TOP_N);

    let mut top_ports: Vec<(u16, u64)> = accum
        .dst_ports
        .iter()
        .map(|(port, count)| (*port, *count))
        .collect();
    top_ports.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_ports.truncate(BASELINE_TOP_N);

    Baseline {
        avg_pps: accum.packets as f64 / elapsed,
        avg_bps: accum.bytes as f64 / elapsed,
        dst_ips: top_ips.into_iter().map(|(ip, _)| ip).collect(),
        dst_ports: top_ports.into_iter().map(|(port, _)| port).collect(),
        protocols: accum.protocols.iter().cloned().collect(),
        sparse: accum.packets < min_packets,
        established_at: ended,
        updated_at: ended,
    }
}

/// One allow rule per observed destination IP and port at priority 100,
/// closed by the default deny at priority 0.
pub fn least_privilege_policy(device_id: &str, baseline: &Baseline) -> Policy {
    let now = Utc::now();
    let mut rules = Vec::new();

    for dst_ip in &baseline.dst_ips {
        rules.push(PolicyRule {
            matches: RuleMatch {
                dst_ip: Some(dst_ip.clone()),
                ..RuleMatch::default()
            },
            action: PolicyAction::Allow,
            priority: 100,
        });
    }
    for dst_port in &baseline.dst_ports {
        rules.push(PolicyRule {
            matches: RuleMatch {
                dst_port: Some(*dst_port),
                ..RuleMatch::default()
            },
            action: PolicyAction::Allow,
            priority: 100,
        });
    }
    rules.push(PolicyRule {
        matches: RuleMatch::default(),
        action: PolicyAction::Deny,
        priority: 0,
    });

    Policy {
        device_id: device_id.to_string(),
        rules,
        generated_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accum_with(packets: u64, ips: &[(&str, u64)], ports: &[(u16, u64)]) -> ProfilingAccum {
        ProfilingAccum {
            packets,
            bytes: packets * 100,
            dst_ips: ips.iter().map(|(ip, c)| (ip.to_string(), *c)).collect(),
            dst_ports: ports.iter().copied().collect(),
            protocols: ["tcp".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_baseline_rates_use_elapsed_window() {
        let started = Utc::now() - chrono::Duration::seconds(300);
        let accum = accum_with(300, &[("10.0.0.10", 300)], &[(443, 300)]);
        let baseline = compute_baseline(&accum, started, Utc::now(), 5);

        assert!((baseline.avg_pps - 1.0).abs() < 0.05, "pps {}", baseline.avg_pps);
        assert!(baseline.avg_bps > 0.0);
        assert!(!baseline.sparse);
    }

    #[test]
    fn test_sparse_baseline_flagged() {
        let started = Utc::now() - chrono::Duration::seconds(300);
        let accum = accum_with(2, &[("10.0.0.10", 2)], &[]);
        let baseline = compute_baseline(&accum, started, Utc::now(), 5);
        assert!(baseline.sparse);
    }

    #[test]
    fn test_top_n_caps_destination_lists() {
        let started = Utc::now() - chrono::Duration::seconds(60);
        let ips: Vec<(String, u64)> = (0..25)
            .map(|i| (format!("10.0.0.{}", i), (i + 1) as u64))
            .collect();
        let accum = ProfilingAccum {
            packets: 500,
            bytes: 50_000,
            dst_ips: ips.into_iter().collect(),
            dst_ports: HashMap::new(),
            protocols: BTreeSet::new(),
        };
        let baseline = compute_baseline(&accum, started, Utc::now(), 5);
        assert_eq!(baseline.dst_ips.len(), BASELINE_TOP_N);
        // Highest-count destination survives the cut.
        assert!(baseline.dst_ips.contains(&"10.0.0.24".to_string()));
    }

    #[test]
    fn test_least_privilege_policy_shape() {
        let now = Utc::now();
        let baseline = Baseline {
            avg_pps: 0.3,
            avg_bps: 40.0,
            dst_ips: vec!["10.0.0.10".to_string()],
            dst_ports: vec![443],
            protocols: vec!["tcp".to_string()],
            sparse: false,
            established_at: now,
            updated_at: now,
        };
        let policy = least_privilege_policy("d-1", &baseline);

        assert_eq!(policy.rules.len(), 3);
        assert_eq!(policy.rules[0].matches.dst_ip.as_deref(), Some("10.0.0.10"));
        assert_eq!(policy.rules[0].priority, 100);
        assert_eq!(policy.rules[1].matches.dst_port, Some(443));
        assert!(policy.ends_with_default_deny());
    }
}
