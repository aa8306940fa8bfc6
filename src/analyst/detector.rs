//! Anomaly detector
//!
//! Compares each flow sample to the device's baseline and raises
//! severity-tagged alerts. A rule fires at most once per device per
//! anomaly window. Clean samples adapt the baseline; anomalous traffic
//! is never learned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::analyst::baseline::ema_update;
use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::models::{Alert, AlertKind, Baseline, FlowSample, Severity};
use crate::identity::IdentityStore;
use crate::trust::TrustScorer;

/// Minimum absolute destination counts before the scan rules may fire.
const NETSCAN_FLOOR: usize = 20;
const PORTSCAN_FLOOR: usize = 10;

/// Evaluate the four anomaly rules against one sample. Baseline values
/// of zero count as one for ratio purposes.
pub fn evaluate_rules(baseline: &Baseline, sample: &FlowSample) -> Vec<(AlertKind, Severity)> {
    let mut fired = Vec::new();

    let base_pps = if baseline.avg_pps > 0.0 { baseline.avg_pps } else { 1.0 };
    let base_bps = if baseline.avg_bps > 0.0 { baseline.avg_bps } else { 1.0 };
    let base_ips = baseline.dst_ips.len().max(1);
    let base_ports = baseline.dst_ports.len().max(1);

    if sample.pps >= 10.0 * base_pps {
        fired.push((AlertKind::Dos, Severity::High));
    } else if sample.pps >= 5.0 * base_pps {
        fired.push((AlertKind::Dos, Severity::Medium));
    } else if sample.pps >= 2.0 * base_pps {
        fired.push((AlertKind::Dos, Severity::Low));
    }

    if sample.bps >= 10.0 * base_bps {
        fired.push((AlertKind::Volume, Severity::High));
    }

    if sample.unique_dst_ips >= 5 * base_ips && sample.unique_dst_ips >= NETSCAN_FLOOR {
        fired.push((AlertKind::NetworkScan, Severity::Medium));
    }

    if sample.unique_dst_ports >= 3 * base_ports && sample.unique_dst_ports >= PORTSCAN_FLOOR {
        fired.push((AlertKind::PortScan, Severity::Medium));
    }

    fired
}

pub struct AnomalyDetector {
    store: Arc<IdentityStore>,
    scorer: Arc<TrustScorer>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    /// Flood control: last fire time per device and rule.
    last_fired: StdMutex<HashMap<(String, AlertKind), Instant>>,
    running: Arc<AtomicBool>,
}

impl AnomalyDetector {
    pub fn new(
        store: Arc<IdentityStore>,
        scorer: Arc<TrustScorer>,
        bus: EventBus,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            scorer,
            bus,
            config,
            last_fired: StdMutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consume flow samples from the bus until stopped.
    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let detector = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            info!("[ANALYST] Anomaly detector started");
            while detector.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Some(CoreEvent::FlowSample(sample)) => {
                        if let Err(err) = detector.handle_sample(&sample).await {
                            warn!(
                                "[ANALYST] Sample handling failed for {}: {}",
                                sample.device_id, err
                            );
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            info!("[ANALYST] Anomaly detector stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Evaluate one sample; returns the alerts actually raised after
    /// flood control.
    pub async fn handle_sample(&self, sample: &FlowSample) -> CoreResult<Vec<Alert>> {
        // No baseline yet (still profiling): nothing to compare.
        let Some(current) = self.store.get_baseline(&sample.device_id).await? else {
            return Ok(Vec::new());
        };

        let fired = evaluate_rules(&current, sample);

        if fired.is_empty() {
            // Normal traffic adapts the baseline.
            let adapted = ema_update(&current, sample, self.config.baseline_ema_alpha);
            self.store.put_baseline(&sample.device_id, &adapted).await?;
            return Ok(Vec::new());
        }

        let mut raised = Vec::new();
        for (kind, severity) in fired {
            if !self.should_fire(&sample.device_id, kind) {
                continue;
            }

            self.scorer
                .record_alert(&sample.device_id, kind, severity)
                .await?;

            let alert = Alert::new(
                sample.device_id.clone(),
                kind,
                severity,
                format!(
                    "{} anomaly: pps={:.1} bps={:.0} dst_ips={} dst_ports={}",
                    kind, sample.pps, sample.bps, sample.unique_dst_ips, sample.unique_dst_ports
                ),
            )
            .with_observed(sample.clone());

            warn!(
                "[ANALYST] {} on {} ({})",
                kind, sample.device_id, severity
            );
            self.bus.publish(CoreEvent::AlertRaised(alert.clone()));
            raised.push(alert);
        }
        Ok(raised)
    }

    fn should_fire(&self, device_id: &str, kind: AlertKind) -> bool {
        let mut last_fired = self.last_fired.lock().expect("flood control poisoned");
        let key = (device_id.to_string(), kind);
        let now = Instant::now();
        match last_fired.get(&key) {
            Some(last) if now.duration_since(*last).as_secs() < self.config.anomaly_window_s => {
                false
            }
            _ => {
                last_fired.insert(key, now);
                true
            }
        }
    }
}
