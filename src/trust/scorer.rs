//! Trust scorer
//!
//! Maintains a persistent per-device score in [0,100], adjusted by
//! alerts, attestation failures and honeypot intelligence. Threshold
//! crossings publish `TrustChanged` events; hysteresis keeps a device
//! hovering at a boundary from flapping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tracing::{debug, info};

use crate::bus::{CoreEvent, EventBus};
use crate::error::CoreResult;
use crate::identity::store::DeviceLocks;
use crate::identity::IdentityStore;
use crate::models::{AlertKind, Severity, TrustEvent, TrustLevel};

/// Delta applied for an attestation failure, regardless of severity.
const ATTESTATION_FAIL_DELTA: i64 = -20;
/// Reward for explicitly recorded positive behavior.
const POSITIVE_BEHAVIOR_DELTA: i64 = 5;
/// Hourly drift for uneventful devices, when the tick is enabled.
const POSITIVE_TICK_DELTA: i64 = 2;

/// Severity-to-delta table for device-scoped alerts. The honeypot row
/// has no low entry: low-severity hits inform threat intel only.
pub fn delta_for_alert(kind: AlertKind, severity: Severity) -> Option<i64> {
    match kind {
        AlertKind::Dos | AlertKind::Volume | AlertKind::NetworkScan | AlertKind::PortScan => {
            Some(match severity {
                Severity::Low => -5,
                Severity::Medium => -15,
                Severity::High | Severity::Critical => -30,
            })
        }
        AlertKind::AttestationFail => Some(ATTESTATION_FAIL_DELTA),
        AlertKind::HoneypotHit => match severity {
            Severity::Low => None,
            Severity::Medium => Some(-20),
            Severity::High => Some(-40),
            Severity::Critical => Some(-60),
        },
    }
}

/// Delta for externally sourced security alerts.
pub fn delta_for_security_alert(severity: Severity) -> i64 {
    match severity {
        Severity::Low => -10,
        Severity::Medium => -20,
        Severity::High | Severity::Critical => -40,
    }
}

/// Per-device trust score with persistent history.
pub struct TrustScorer {
    store: Arc<IdentityStore>,
    bus: EventBus,
    locks: Arc<DeviceLocks>,
    scores: StdMutex<HashMap<String, i64>>,
    /// Score at the last published crossing, per device. Crossings are
    /// judged against this anchor, so a device hovering inside the
    /// hysteresis band cannot flap.
    anchors: StdMutex<HashMap<String, i64>>,
    thresholds: Vec<i64>,
    hysteresis: i64,
    initial: i64,
}

impl TrustScorer {
    pub fn new(
        store: Arc<IdentityStore>,
        bus: EventBus,
        initial: i64,
        thresholds: Vec<i64>,
        hysteresis: i64,
    ) -> Self {
        let locks = store.locks();
        Self {
            store,
            bus,
            locks,
            scores: StdMutex::new(HashMap::new()),
            anchors: StdMutex::new(HashMap::new()),
            thresholds,
            hysteresis,
            initial,
        }
    }

    /// Idempotent initialization at onboarding: a device that already has
    /// history keeps its recovered score.
    pub async fn initialize(&self, device_id: &str) -> CoreResult<i64> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;

        if let Some(score) = self.lookup(device_id)? {
            return Ok(score);
        }

        let event = TrustEvent {
            device_id: device_id.to_string(),
            score_after: self.initial,
            delta: 0,
            reason: "initialized".to_string(),
            created_at: Utc::now(),
        };
        self.store.append_trust_event(&event)?;
        self.cache(device_id, self.initial);
        info!("[TRUST] Initialized {} at {}", device_id, self.initial);
        Ok(self.initial)
    }

    /// Apply a delta under the device lock, clamp to [0,100], append
    /// history, and publish a `TrustChanged` event when a threshold is
    /// crossed.
    pub async fn adjust(&self, device_id: &str, delta: i64, reason: &str) -> CoreResult<i64> {
        let lock = self.locks.lock_for(device_id);
        let _guard = lock.lock().await;
        self.adjust_locked(device_id, delta, reason)
    }

    fn adjust_locked(&self, device_id: &str, delta: i64, reason: &str) -> CoreResult<i64> {
        let current = self.lookup(device_id)?.unwrap_or(self.initial);
        let updated = (current + delta).clamp(0, 100);
        let applied = updated - current;

        let event = TrustEvent {
            device_id: device_id.to_string(),
            score_after: updated,
            delta: applied,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.store.append_trust_event(&event)?;
        self.cache(device_id, updated);

        debug!(
            "[TRUST] {} {} -> {} ({})",
            device_id, current, updated, reason
        );

        let anchor = {
            let anchors = self.anchors.lock().expect("anchor map poisoned");
            anchors.get(device_id).copied().unwrap_or(current)
        };
        if self.crossed_threshold(anchor, updated) {
            let mut anchors = self.anchors.lock().expect("anchor map poisoned");
            anchors.insert(device_id.to_string(), updated);
            drop(anchors);
            self.bus.publish(CoreEvent::TrustChanged {
                device_id: device_id.to_string(),
                previous: current,
                current: updated,
            });
        }

        Ok(updated)
    }

    /// A downward crossing fires the moment the score passes under a
    /// threshold; recovering upward requires clearing the threshold plus
    /// hysteresis. The anchor is the score at the last published
    /// crossing, so partial recoveries inside the band stay silent.
    fn crossed_threshold(&self, anchor: i64, current: i64) -> bool {
        for &threshold in &self.thresholds {
            if anchor >= threshold && current < threshold {
                return true;
            }
            if anchor < threshold && current >= threshold + self.hysteresis {
                return true;
            }
        }
        false
    }

    /// Record a device-scoped alert and apply its trust penalty.
    pub async fn record_alert(
        &self,
        device_id: &str,
        kind: AlertKind,
        severity: Severity,
    ) -> CoreResult<i64> {
        match delta_for_alert(kind, severity) {
            Some(delta) => {
                self.adjust(device_id, delta, &format!("{}:{}", kind, severity))
                    .await
            }
            None => Ok(self.get(device_id).unwrap_or(self.initial)),
        }
    }

    /// Record an externally sourced security alert.
    pub async fn record_security_alert(
        &self,
        device_id: &str,
        alert_type: &str,
        severity: Severity,
    ) -> CoreResult<i64> {
        self.adjust(
            device_id,
            delta_for_security_alert(severity),
            &format!("security_alert:{}", alert_type),
        )
        .await
    }

    pub async fn record_attestation_failure(
        &self,
        device_id: &str,
        reason: &str,
    ) -> CoreResult<i64> {
        self.adjust(
            device_id,
            ATTESTATION_FAIL_DELTA,
            &format!("attestation_fail:{}", reason),
        )
        .await
    }

    pub async fn record_positive_behavior(
        &self,
        device_id: &str,
        reason: &str,
    ) -> CoreResult<i64> {
        self.adjust(
            device_id,
            POSITIVE_BEHAVIOR_DELTA,
            &format!("positive:{}", reason),
        )
        .await
    }

    /// Hourly drift for devices with no negative history in the last
    /// hour. Only runs when enabled in configuration.
    pub async fn apply_positive_tick(&self) -> CoreResult<usize> {
        let devices = self.store.list_devices().await?;
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let mut ticked = 0usize;

        for device in devices {
            if device.status != crate::models::DeviceStatus::Active {
                continue;
            }
            let recent = self.store.trust_history(&device.device_id, 20)?;
            let uneventful = recent
                .iter()
                .filter(|e| e.created_at >= cutoff)
                .all(|e| e.delta >= 0);
            if uneventful {
                self.adjust(&device.device_id, POSITIVE_TICK_DELTA, "uneventful_hour")
                    .await?;
                ticked += 1;
            }
        }
        Ok(ticked)
    }

    /// Current score, from cache or recovered from history.
    pub fn get(&self, device_id: &str) -> Option<i64> {
        self.lookup(device_id).ok().flatten()
    }

    pub fn level(&self, device_id: &str) -> Option<TrustLevel> {
        self.get(device_id).map(TrustLevel::from_score)
    }

    pub fn all_scores(&self) -> HashMap<String, i64> {
        self.scores.lock().expect("score cache poisoned").clone()
    }

    fn lookup(&self, device_id: &str) -> CoreResult<Option<i64>> {
        {
            let scores = self.scores.lock().expect("score cache poisoned");
            if let Some(&score) = scores.get(device_id) {
                return Ok(Some(score));
            }
        }
        let persisted = self.store.current_trust(device_id)?;
        if let Some(score) = persisted {
            self.cache(device_id, score);
        }
        Ok(persisted)
    }

    fn cache(&self, device_id: &str, score: i64) {
        let mut scores = self.scores.lock().expect("score cache poisoned");
        scores.insert(device_id.to_string(), score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn scorer() -> (TrustScorer, EventBus) {
        let store = Arc::new(IdentityStore::new(Database::in_memory().expect("db")));
        let bus = EventBus::new(64);
        let scorer = TrustScorer::new(store, bus.clone(), 70, vec![70, 50, 30], 5);
        (scorer, bus)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (scorer, _bus) = scorer();
        assert_eq!(scorer.initialize("d-1").await.expect("init"), 70);
        scorer.adjust("d-1", -15, "test").await.expect("adjust");
        assert_eq!(
            scorer.initialize("d-1").await.expect("re-init"),
            55,
            "re-initialization must not reset the score"
        );
    }

    #[tokio::test]
    async fn test_clamping_and_history_consistency() {
        let (scorer, _bus) = scorer();
        scorer.initialize("d-1").await.expect("init");
        scorer.adjust("d-1", -60, "big hit").await.expect("adjust");
        let score = scorer.adjust("d-1", -60, "bigger hit").await.expect("adjust");
        assert_eq!(score, 0, "score clamps at zero");

        let score = scorer.adjust("d-1", 150, "absurd reward").await.expect("adjust");
        assert_eq!(score, 100, "score clamps at one hundred");
    }

    #[tokio::test]
    async fn test_threshold_crossing_publishes_event() {
        let (scorer, bus) = scorer();
        let mut rx = bus.subscribe();

        scorer.initialize("d-1").await.expect("init");
        scorer.adjust("d-1", -25, "anomaly").await.expect("adjust"); // 70 -> 45

        let event = rx.recv().await.expect("event");
        match event {
            CoreEvent::TrustChanged {
                device_id,
                previous,
                current,
            } => {
                assert_eq!(device_id, "d-1");
                assert_eq!(previous, 70);
                assert_eq!(current, 45);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hysteresis_suppresses_upward_flap() {
        let (scorer, bus) = scorer();
        let mut rx = bus.subscribe();

        scorer.initialize("d-1").await.expect("init");
        scorer.adjust("d-1", -22, "drop").await.expect("adjust"); // 48, crosses 50 and 70
        assert!(rx.recv().await.is_some());

        // 48 -> 52: above 50 but under 55, no upward event.
        scorer.adjust("d-1", 4, "slight recovery").await.expect("adjust");
        assert!(rx.try_recv().is_none(), "no event inside hysteresis band");

        // 52 -> 56: clears 50 + 5.
        scorer.adjust("d-1", 4, "real recovery").await.expect("adjust");
        assert!(rx.try_recv().is_some(), "event after clearing hysteresis");
    }

    #[tokio::test]
    async fn test_alert_table_matches_documented_deltas() {
        assert_eq!(delta_for_alert(AlertKind::PortScan, Severity::Medium), Some(-15));
        assert_eq!(delta_for_alert(AlertKind::Dos, Severity::High), Some(-30));
        assert_eq!(delta_for_alert(AlertKind::AttestationFail, Severity::Low), Some(-20));
        assert_eq!(delta_for_alert(AlertKind::HoneypotHit, Severity::Critical), Some(-60));
        assert_eq!(delta_for_alert(AlertKind::HoneypotHit, Severity::Low), None);
        assert_eq!(delta_for_security_alert(Severity::Medium), -20);
    }

    #[tokio::test]
    async fn test_history_sums_to_current_score() {
        let (scorer, _bus) = scorer();
        scorer.initialize("d-1").await.expect("init");
        for delta in [-15, -20, 10, -60, 40] {
            scorer.adjust("d-1", delta, "step").await.expect("adjust");
        }

        let store = Arc::clone(&scorer.store);
        let history = store.trust_history("d-1", 100).expect("history");
        let mut replayed = 0i64;
        for event in history.iter().rev() {
            if event.reason == "initialized" {
                replayed = event.score_after;
            } else {
                replayed = (replayed + event.delta).clamp(0, 100);
            }
            assert_eq!(replayed, event.score_after, "each row reflects its clamp");
        }
        assert_eq!(Some(replayed), scorer.get("d-1"));
    }
}
