//! Flow poller
//!
//! Polls the switch adapter at a fixed cadence for per-device counters,
//! turns them into rate samples, and publishes them on the bus. Devices
//! with no traffic still produce zero samples; a missing switch is a
//! degraded state, not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::identity::IdentityStore;
use crate::models::{DeviceStatus, FlowSample, FlowTotals};
use crate::switch::SwitchControl;

pub struct FlowPoller {
    store: Arc<IdentityStore>,
    switch: Arc<dyn SwitchControl>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    running: Arc<AtomicBool>,
}

impl FlowPoller {
    pub fn new(
        store: Arc<IdentityStore>,
        switch: Arc<dyn SwitchControl>,
        bus: EventBus,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            switch,
            bus,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "[POLLER] Flow polling started (interval: {}s)",
                poller.config.flow_poll_interval_s
            );
            while poller.running.load(Ordering::SeqCst) {
                if let Err(err) = poller.poll_once().await {
                    warn!("[POLLER] Poll cycle failed: {}", err);
                }
                for _ in 0..poller.config.flow_poll_interval_s {
                    if !poller.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            info!("[POLLER] Flow polling stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One poll cycle: fetch counters, map MACs to devices, publish a
    /// sample per enforced device (zero when silent).
    pub async fn poll_once(&self) -> CoreResult<usize> {
        let devices = self.store.list_devices().await?;
        let enforced: Vec<_> = devices
            .into_iter()
            .filter(|d| {
                matches!(
                    d.status,
                    DeviceStatus::Profiling | DeviceStatus::Active
                )
            })
            .collect();
        if enforced.is_empty() {
            return Ok(0);
        }

        let totals: HashMap<String, FlowTotals> = match self.switch.get_flow_stats().await {
            Ok(stats) => stats.into_iter().map(|t| (t.mac.clone(), t)).collect(),
            Err(err) => {
                // Degraded data plane: every device yields a zero sample.
                debug!("[POLLER] Switch stats unavailable: {}", err);
                HashMap::new()
            }
        };

        let now = Utc::now();
        let mut published = 0usize;
        for device in enforced {
            let sample = match totals.get(&device.mac) {
                Some(total) => {
                    let window = total.window_seconds.max(1) as f64;
                    FlowSample {
                        device_id: device.device_id.clone(),
                        mac: device.mac.clone(),
                        pps: total.packets as f64 / window,
                        bps: total.bytes as f64 / window,
                        unique_dst_ips: total.dst_ips.len(),
                        unique_dst_ports: total.dst_ports.len(),
                        protocols: total.protocols.clone(),
                        window_seconds: total.window_seconds,
                        sampled_at: now,
                    }
                }
                None => FlowSample {
                    device_id: device.device_id.clone(),
                    mac: device.mac.clone(),
                    pps: 0.0,
                    bps: 0.0,
                    unique_dst_ips: 0,
                    unique_dst_ports: 0,
                    protocols: Vec::new(),
                    window_seconds: self.config.flow_poll_interval_s,
                    sampled_at: now,
                },
            };

            if sample.pps > 0.0 {
                self.store
                    .set_last_seen(&device.device_id, now, None)
                    .await?;
            }

            self.bus.publish(CoreEvent::FlowSample(sample));
            published += 1;
        }
        Ok(published)
    }
}
