//! Traffic orchestrator
//!
//! The single decision point. Fuses device status, trust score, recent
//! alerts and threat intelligence into one decision per device, and is
//! the only writer of device-scoped rules to the switch adapter.
//! Decisions are idempotent: a rule is installed only when the decision
//! changes, and every change lands in the audit table.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::identity::store::DeviceLocks;
use crate::identity::IdentityStore;
use crate::models::{
    AlertKind, DecisionAudit, Decision, Device, DeviceStatus, MitigationRule, PolicyAction,
    RuleMatch, Severity,
};
use crate::switch::{RuleAction, RuleSpec, SwitchControl};
use crate::trust::TrustScorer;

/// Rule priorities for decision-scoped rules.
const REDIRECT_PRIORITY: u16 = 150;
const DENY_PRIORITY: u16 = 200;
const QUARANTINE_PRIORITY: u16 = 65_535;

/// Trust needed to recover into a less restrictive decision
/// (threshold + hysteresis).
const RECOVER_TO_ALLOW: i64 = 75;
const RECOVER_TO_REDIRECT: i64 = 55;
const RECOVER_TO_DENY: i64 = 35;

/// Compute the intended decision for a device. First match wins.
pub fn decide(
    status: DeviceStatus,
    trust: i64,
    highest_recent: Option<Severity>,
) -> (Decision, &'static str) {
    if matches!(status, DeviceStatus::Revoked | DeviceStatus::Quarantined) {
        return (Decision::Quarantine, "status");
    }
    match highest_recent {
        Some(Severity::Critical) => return (Decision::Quarantine, "critical_alert"),
        Some(Severity::High) => return (Decision::Quarantine, "high_alert"),
        _ => {}
    }
    if trust < 30 {
        return (Decision::Quarantine, "trust_below_30");
    }
    if highest_recent == Some(Severity::Medium) {
        return (Decision::Deny, "medium_alert");
    }
    if trust < 50 {
        return (Decision::Deny, "trust_below_50");
    }
    if trust < 70 {
        return (Decision::Redirect, "trust_below_70");
    }
    (Decision::Allow, "trusted")
}

/// Trust floor required to move into a less restrictive decision.
fn recovery_floor(target: Decision) -> i64 {
    match target {
        Decision::Allow => RECOVER_TO_ALLOW,
        Decision::Redirect => RECOVER_TO_REDIRECT,
        Decision::Deny => RECOVER_TO_DENY,
        Decision::Quarantine => i64::MIN,
    }
}

pub struct TrafficOrchestrator {
    store: Arc<IdentityStore>,
    scorer: Arc<TrustScorer>,
    switch: Arc<dyn SwitchControl>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    /// Per-device decision locks, held only while computing + installing.
    decision_locks: DeviceLocks,
    last_installed: StdMutex<HashMap<String, Decision>>,
    /// Sliding per-device alert window.
    recent_alerts: StdMutex<HashMap<String, VecDeque<(DateTime<Utc>, AlertKind, Severity)>>>,
    installed_mitigations: StdMutex<HashMap<String, MitigationRule>>,
    /// Devices whose quarantine requires explicit administrator release.
    quarantine_holds: StdMutex<HashSet<String>>,
    /// Devices forced to DENY after exhausted installs, awaiting reconcile.
    fail_closed: StdMutex<HashSet<String>>,
    running: Arc<AtomicBool>,
}

impl TrafficOrchestrator {
    pub fn new(
        store: Arc<IdentityStore>,
        scorer: Arc<TrustScorer>,
        switch: Arc<dyn SwitchControl>,
        bus: EventBus,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            scorer,
            switch,
            bus,
            config,
            decision_locks: DeviceLocks::default(),
            last_installed: StdMutex::new(HashMap::new()),
            recent_alerts: StdMutex::new(HashMap::new()),
            installed_mitigations: StdMutex::new(HashMap::new()),
            quarantine_holds: StdMutex::new(HashSet::new()),
            fail_closed: StdMutex::new(HashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn last_installed(&self, device_id: &str) -> Option<Decision> {
        self.last_installed
            .lock()
            .expect("decision map poisoned")
            .get(device_id)
            .copied()
    }

    pub fn installed_mitigation_count(&self) -> usize {
        self.installed_mitigations
            .lock()
            .expect("mitigation map poisoned")
            .len()
    }

    /// Restore persisted state after a restart: reinstall stored
    /// mitigation rules and recompute every device's decision.
    pub async fn restore(&self) -> CoreResult<()> {
        for rule in self.store.list_mitigations()? {
            if let Err(err) = self.apply_mitigation(&rule, false).await {
                warn!(
                    "[ORCH] Failed to restore mitigation {}: {}",
                    rule.rule_id, err
                );
            }
        }
        for device in self.store.list_devices().await? {
            if let Err(err) = self.reevaluate(&device.device_id, "restore").await {
                warn!(
                    "[ORCH] Failed to restore decision for {}: {}",
                    device.device_id, err
                );
            }
        }
        Ok(())
    }

    /// Consume bus events until stopped. Events arrive on one task, so
    /// per-device ordering follows arrival order.
    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            info!("[ORCH] Orchestrator started");
            while orchestrator.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Some(event) => {
                        if let Err(err) = orchestrator.handle_event(event).await {
                            error!("[ORCH] Event handling failed: {}", err);
                        }
                    }
                    None => break,
                }
            }
            info!("[ORCH] Orchestrator stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn handle_event(&self, event: CoreEvent) -> CoreResult<()> {
        match event {
            CoreEvent::TrustChanged { device_id, .. } => {
                self.reevaluate(&device_id, "trust_changed").await
            }
            CoreEvent::AlertRaised(alert) => {
                {
                    let mut recent = self.recent_alerts.lock().expect("alert window poisoned");
                    recent
                        .entry(alert.device_id.clone())
                        .or_default()
                        .push_back((alert.created_at, alert.kind, alert.severity));
                }
                self.reevaluate(&alert.device_id, "alert").await
            }
            CoreEvent::ThreatUpdated { source_ip, .. } => {
                // A threat re-enters the decision for any device it maps to.
                let devices = self.store.list_devices().await?;
                for device in devices {
                    if device.last_ip.as_deref() == Some(source_ip.as_str()) {
                        self.reevaluate(&device.device_id, "threat_updated").await?;
                    }
                }
                Ok(())
            }
            CoreEvent::PolicyReplaced { device_id } => {
                // Force reinstall of the stored policy if currently allowed.
                {
                    let mut last = self.last_installed.lock().expect("decision map poisoned");
                    if last.get(&device_id) == Some(&Decision::Allow) {
                        last.remove(&device_id);
                    }
                }
                self.reevaluate(&device_id, "policy_replaced").await
            }
            CoreEvent::DeviceStatusChanged { device_id, .. } => {
                self.reevaluate(&device_id, "status_changed").await
            }
            CoreEvent::MitigationProposed(rule) => {
                self.apply_mitigation(&rule, true).await.map(|_| ())
            }
            CoreEvent::MitigationExpired { rule_id } => self.remove_mitigation(&rule_id).await,
            CoreEvent::FlowSample(_) => Ok(()),
        }
    }

    /// Highest severity among recent non-behavioral alerts and matching
    /// threats. Behavioral anomalies enter the decision through their
    /// trust penalty; counting them here as well would double-punish a
    /// single observation and skip the graduated response.
    fn highest_recent_severity(&self, device: &Device) -> CoreResult<Option<Severity>> {
        let alert_cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.alert_window_s as i64);
        let from_alerts = {
            let mut recent = self.recent_alerts.lock().expect("alert window poisoned");
            if let Some(window) = recent.get_mut(&device.device_id) {
                while window
                    .front()
                    .is_some_and(|(at, _, _)| *at < alert_cutoff)
                {
                    window.pop_front();
                }
                window
                    .iter()
                    .filter(|(_, kind, _)| {
                        matches!(kind, AlertKind::HoneypotHit | AlertKind::AttestationFail)
                    })
                    .map(|(_, _, severity)| *severity)
                    .max()
            } else {
                None
            }
        };

        let from_threats = match device.last_ip.as_deref() {
            Some(ip) => self.store.get_threat(ip)?.map(|t| t.severity),
            None => None,
        };

        Ok(from_alerts.max(from_threats))
    }

    /// True when a medium-or-worse alert landed inside the recovery window.
    fn recent_medium_alert(&self, device_id: &str) -> bool {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.recovery_window_s as i64);
        let recent = self.recent_alerts.lock().expect("alert window poisoned");
        recent
            .get(device_id)
            .map(|window| {
                window
                    .iter()
                    .any(|(at, _, severity)| *at >= cutoff && *severity >= Severity::Medium)
            })
            .unwrap_or(false)
    }

    /// Recompute and, if changed, install the decision for one device.
    pub async fn reevaluate(&self, device_id: &str, cause: &str) -> CoreResult<()> {
        let lock = self.decision_locks.lock_for(device_id);
        let _guard = lock.lock().await;

        let Some(device) = self.store.find_device(device_id).await? else {
            return Ok(());
        };

        // Pending devices have no data-plane presence yet; profiling
        // devices run under the observation rule unless degraded.
        let trust = self
            .scorer
            .get(device_id)
            .unwrap_or(self.config.initial_trust_score);
        let highest = self.highest_recent_severity(&device)?;
        let (mut intended, mut reason) = decide(device.status, trust, highest);

        if device.status == DeviceStatus::Pending {
            return Ok(());
        }
        if device.status == DeviceStatus::Profiling && intended == Decision::Allow {
            return Ok(());
        }

        // Redirect needs a deception path to send traffic down.
        if intended == Decision::Redirect && self.config.honeypot_port.is_none() {
            intended = Decision::Deny;
            reason = "redirect_unavailable";
        }

        let prev = self.last_installed(device_id);
        if prev == Some(intended) {
            return Ok(());
        }

        // Recovering to a weaker stance is gated by hysteresis, a quiet
        // recovery window, and (for quarantine) administrator release.
        if let Some(prev_decision) = prev {
            if intended.restrictiveness() < prev_decision.restrictiveness() {
                if prev_decision == Decision::Quarantine
                    && self
                        .quarantine_holds
                        .lock()
                        .expect("quarantine holds poisoned")
                        .contains(device_id)
                {
                    return Ok(());
                }
                if trust < recovery_floor(intended) || self.recent_medium_alert(device_id) {
                    return Ok(());
                }
            }
        }

        let correlation_id = Uuid::new_v4().to_string();
        match self.install_decision(&device, intended).await {
            Ok(()) => {
                self.record_decision(
                    &device, trust, highest, intended, reason, prev, &correlation_id,
                );
                if intended == Decision::Quarantine {
                    self.quarantine_holds
                        .lock()
                        .expect("quarantine holds poisoned")
                        .insert(device_id.to_string());
                }
                self.fail_closed
                    .lock()
                    .expect("fail-closed set poisoned")
                    .remove(device_id);
                info!(
                    "[ORCH] {} {} -> {} ({}, cause={})",
                    device_id,
                    prev.map(|d| d.as_str()).unwrap_or("none"),
                    intended,
                    reason,
                    cause
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "[ORCH] Install failed for {} ({}), failing closed: {}",
                    device_id, intended, err
                );
                // Best-effort drop; even if the switch is gone we record
                // DENY so nothing weaker is believed installed.
                let _ = self
                    .switch
                    .install_rule(RuleSpec {
                        rule_id: format!("dev-{}-deny", device_id),
                        matches: RuleMatch::eth_src(device.mac.clone()),
                        action: RuleAction::Drop,
                        priority: DENY_PRIORITY,
                    })
                    .await;
                self.last_installed
                    .lock()
                    .expect("decision map poisoned")
                    .insert(device_id.to_string(), Decision::Deny);
                self.fail_closed
                    .lock()
                    .expect("fail-closed set poisoned")
                    .insert(device_id.to_string());
                self.record_decision(
                    &device,
                    trust,
                    highest,
                    Decision::Deny,
                    "fail_closed",
                    prev,
                    &correlation_id,
                );
                Err(err)
            }
        }
    }

    fn record_decision(
        &self,
        device: &Device,
        trust: i64,
        threat_level: Option<Severity>,
        decision: Decision,
        reason: &str,
        prev: Option<Decision>,
        correlation_id: &str,
    ) {
        self.last_installed
            .lock()
            .expect("decision map poisoned")
            .insert(device.device_id.clone(), decision);

        let audit = DecisionAudit {
            created_at: Utc::now(),
            device_id: device.device_id.clone(),
            trust,
            threat_level,
            decision,
            reason: reason.to_string(),
            prev_decision: prev,
            correlation_id: correlation_id.to_string(),
        };
        if let Err(err) = self.store.append_audit(&audit) {
            error!("[ORCH] Audit write failed for {}: {}", device.device_id, err);
        }
    }

    /// Install the rules realizing a decision, retrying transient
    /// failures with exponential backoff.
    async fn install_decision(&self, device: &Device, decision: Decision) -> CoreResult<()> {
        let mut delay = Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 0..=self.config.rule_install_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self.try_install_decision(device, decision).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        "[ORCH] Install attempt {} for {} failed: {}",
                        attempt + 1,
                        device.device_id,
                        err
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(CoreError::SwitchUnavailable))
    }

    async fn try_install_decision(&self, device: &Device, decision: Decision) -> CoreResult<()> {
        self.remove_device_rules(&device.device_id).await?;

        match decision {
            Decision::Allow => {
                let policy = self
                    .store
                    .get_policy(&device.device_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("policy", &device.device_id))?;
                for (index, rule) in policy.rules.iter().enumerate() {
                    let mut matches = rule.matches.clone();
                    matches.eth_src = Some(device.mac.clone());
                    self.switch
                        .install_rule(RuleSpec {
                            rule_id: format!("dev-{}-policy-{}", device.device_id, index),
                            matches,
                            action: self.policy_action_to_rule(rule.action),
                            priority: rule.priority,
                        })
                        .await?;
                }
            }
            Decision::Redirect => {
                let port = self
                    .config
                    .honeypot_port
                    .ok_or_else(|| CoreError::conflict("capability_absent: honeypot_port"))?;
                self.switch
                    .install_rule(RuleSpec {
                        rule_id: format!("dev-{}-redirect", device.device_id),
                        matches: RuleMatch::eth_src(device.mac.clone()),
                        action: RuleAction::Output(port),
                        priority: REDIRECT_PRIORITY,
                    })
                    .await?;
            }
            Decision::Deny => {
                self.switch
                    .install_rule(RuleSpec {
                        rule_id: format!("dev-{}-deny", device.device_id),
                        matches: RuleMatch::eth_src(device.mac.clone()),
                        action: RuleAction::Drop,
                        priority: DENY_PRIORITY,
                    })
                    .await?;
            }
            Decision::Quarantine => {
                self.switch
                    .install_rule(RuleSpec {
                        rule_id: format!("dev-{}-quarantine", device.device_id),
                        matches: RuleMatch::eth_src(device.mac.clone()),
                        action: match self.config.quarantine_port {
                            Some(port) => RuleAction::Output(port),
                            None => RuleAction::Drop,
                        },
                        priority: QUARANTINE_PRIORITY,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove every decision-scoped rule for a device. The new decision
    /// installs immediately afterwards, so stale allow rules from a
    /// longer previous policy cannot linger.
    async fn remove_device_rules(&self, device_id: &str) -> CoreResult<()> {
        let prefix = format!("dev-{}-", device_id);
        let rules = self.switch.list_rules().await?;
        for rule in rules {
            if rule.rule_id.starts_with(&prefix) {
                self.switch.remove_rule(&rule.rule_id).await?;
            }
        }
        Ok(())
    }

    fn policy_action_to_rule(&self, action: PolicyAction) -> RuleAction {
        match action {
            PolicyAction::Allow => RuleAction::Forward,
            PolicyAction::Deny => RuleAction::Drop,
            PolicyAction::Monitor => RuleAction::Monitor,
            PolicyAction::Redirect => match self.config.honeypot_port {
                Some(port) => RuleAction::Output(port),
                None => RuleAction::Drop,
            },
        }
    }

    /// Install a mitigation rule proposed by the generator. Deduplicates
    /// by rule id: replaying the same threat a thousand times installs
    /// once. Returns true when an install actually happened.
    pub async fn apply_mitigation(
        &self,
        rule: &MitigationRule,
        audit: bool,
    ) -> CoreResult<bool> {
        {
            let installed = self
                .installed_mitigations
                .lock()
                .expect("mitigation map poisoned");
            if let Some(existing) = installed.get(&rule.rule_id) {
                if existing.action == rule.action && existing.priority == rule.priority {
                    return Ok(false);
                }
            }
        }

        let action = match rule.action {
            PolicyAction::Deny => RuleAction::Drop,
            PolicyAction::Redirect => match self.config.honeypot_port {
                Some(port) => RuleAction::Output(port),
                None => {
                    // No deception path configured: watch instead.
                    warn!(
                        "[ORCH] No honeypot port, downgrading redirect for {} to monitor",
                        rule.origin_threat
                    );
                    RuleAction::Monitor
                }
            },
            PolicyAction::Monitor => RuleAction::Monitor,
            PolicyAction::Allow => RuleAction::Forward,
        };

        self.store.upsert_mitigation(rule)?;

        let mut delay = Duration::from_millis(200);
        let mut last_err = None;
        let mut ok = false;
        for attempt in 0..=self.config.rule_install_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self
                .switch
                .install_rule(RuleSpec {
                    rule_id: rule.rule_id.clone(),
                    matches: rule.matches.clone(),
                    action,
                    priority: rule.priority,
                })
                .await
            {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        if !ok {
            return Err(last_err.unwrap_or(CoreError::SwitchUnavailable));
        }

        self.installed_mitigations
            .lock()
            .expect("mitigation map poisoned")
            .insert(rule.rule_id.clone(), rule.clone());

        if audit {
            let audit_row = DecisionAudit {
                created_at: Utc::now(),
                device_id: format!("mitigation:{}", rule.origin_threat),
                trust: 0,
                threat_level: None,
                decision: match rule.action {
                    PolicyAction::Deny => Decision::Deny,
                    PolicyAction::Redirect => Decision::Redirect,
                    _ => Decision::Allow,
                },
                reason: rule.reason.clone(),
                prev_decision: None,
                correlation_id: Uuid::new_v4().to_string(),
            };
            if let Err(err) = self.store.append_audit(&audit_row) {
                error!("[ORCH] Mitigation audit write failed: {}", err);
            }
        }

        info!(
            "[ORCH] Mitigation {} installed ({} prio {})",
            rule.rule_id, rule.action, rule.priority
        );
        Ok(true)
    }

    pub async fn remove_mitigation(&self, rule_id: &str) -> CoreResult<()> {
        self.installed_mitigations
            .lock()
            .expect("mitigation map poisoned")
            .remove(rule_id);
        self.store.delete_mitigation(rule_id)?;
        if let Err(err) = self.switch.remove_rule(rule_id).await {
            warn!("[ORCH] Failed to remove mitigation {}: {}", rule_id, err);
        }
        Ok(())
    }

    /// Administrator releases a quarantined device back into evaluation.
    pub async fn release_quarantine(&self, device_id: &str) -> CoreResult<()> {
        let device = self.store.get_device(device_id).await?;
        if device.status == DeviceStatus::Quarantined {
            self.store
                .set_status(device_id, DeviceStatus::Active)
                .await?;
        } else if self
            .quarantine_holds
            .lock()
            .expect("quarantine holds poisoned")
            .contains(device_id)
        {
            // Trust-driven quarantine; status is untouched.
        } else {
            return Err(CoreError::conflict(format!(
                "device {} is not quarantined",
                device_id
            )));
        }

        self.quarantine_holds
            .lock()
            .expect("quarantine holds poisoned")
            .remove(device_id);
        self.reevaluate(device_id, "quarantine_released").await
    }

    /// Retry devices that were forced closed; call when the data plane
    /// may have recovered.
    pub async fn reconcile(&self) -> CoreResult<usize> {
        let pending: Vec<String> = {
            let fail_closed = self.fail_closed.lock().expect("fail-closed set poisoned");
            fail_closed.iter().cloned().collect()
        };
        let mut recovered = 0usize;
        for device_id in pending {
            // Drop the cached DENY so the recomputed decision installs.
            self.last_installed
                .lock()
                .expect("decision map poisoned")
                .remove(&device_id);
            if self.reevaluate(&device_id, "reconcile").await.is_ok() {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
