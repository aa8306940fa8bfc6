//! In-process event bus
//!
//! Typed pub/sub wiring the periodic tasks to the orchestrator. Built on
//! a bounded broadcast channel: slow subscribers lose the oldest events
//! rather than blocking publishers, and every loss is counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{Alert, DeviceStatus, FlowSample, MitigationRule, Severity};

/// Every event that crosses component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CoreEvent {
    /// Rate sample for one device, published by the flow poller.
    FlowSample(FlowSample),

    /// A device's trust score crossed a threshold.
    TrustChanged {
        device_id: String,
        previous: i64,
        current: i64,
    },

    /// An alert was raised against a device.
    AlertRaised(Alert),

    /// Threat intelligence for a source IP was created or updated.
    ThreatUpdated { source_ip: String, severity: Severity },

    /// A device's stored policy was regenerated or replaced.
    PolicyReplaced { device_id: String },

    /// A device transitioned between lifecycle states.
    DeviceStatusChanged {
        device_id: String,
        status: DeviceStatus,
    },

    /// The mitigation generator proposed a rule for installation.
    MitigationProposed(MitigationRule),

    /// A non-permanent mitigation expired with its source threat.
    MitigationExpired { rule_id: String },
}

impl CoreEvent {
    /// The device this event concerns, when it is device-scoped.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            CoreEvent::FlowSample(sample) => Some(&sample.device_id),
            CoreEvent::TrustChanged { device_id, .. } => Some(device_id),
            CoreEvent::AlertRaised(alert) => Some(&alert.device_id),
            CoreEvent::PolicyReplaced { device_id } => Some(device_id),
            CoreEvent::DeviceStatusChanged { device_id, .. } => Some(device_id),
            CoreEvent::ThreatUpdated { .. }
            | CoreEvent::MitigationProposed(_)
            | CoreEvent::MitigationExpired { .. } => None,
        }
    }
}

/// Handle for publishing and subscribing to [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; a bus with no subscribers drops
    /// the event silently.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events lost to lagging subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Subscriber side of the bus. Lag is absorbed here: when the channel
/// overflows, the oldest events are discarded, counted, and reception
/// continues with the next available event.
pub struct BusReceiver {
    receiver: broadcast::Receiver<CoreEvent>,
    dropped: Arc<AtomicU64>,
}

impl BusReceiver {
    /// Receive the next event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    self.dropped.fetch_add(lost, Ordering::Relaxed);
                    tracing::warn!("[BUS] Subscriber lagged, dropped {} events", lost);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for drain loops during shutdown.
    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(lost)) => {
                    self.dropped.fetch_add(lost, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(device_id: &str) -> FlowSample {
        FlowSample {
            device_id: device_id.to_string(),
            mac: "aa:bb:cc:00:00:01".to_string(),
            pps: 1.0,
            bps: 100.0,
            unique_dst_ips: 1,
            unique_dst_ports: 1,
            protocols: vec!["tcp".to_string()],
            window_seconds: 10,
            sampled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_reach_subscriber_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::FlowSample(sample("d-1")));
        bus.publish(CoreEvent::PolicyReplaced {
            device_id: "d-1".to_string(),
        });

        match rx.recv().await.expect("first event") {
            CoreEvent::FlowSample(s) => assert_eq!(s.device_id, "d-1"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.expect("second event") {
            CoreEvent::PolicyReplaced { device_id } => assert_eq!(device_id, "d-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..20 {
            bus.publish(CoreEvent::PolicyReplaced {
                device_id: format!("d-{}", i),
            });
        }

        // The first receive absorbs the lag, then yields the oldest
        // event still buffered.
        let first = rx.recv().await.expect("bus still open");
        match first {
            CoreEvent::PolicyReplaced { device_id } => {
                assert_ne!(device_id, "d-0", "oldest events must be dropped");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bus.dropped_events() > 0);
    }

    #[test]
    fn test_device_scoping() {
        let event = CoreEvent::ThreatUpdated {
            source_ip: "198.51.100.7".to_string(),
            severity: Severity::High,
        };
        assert!(event.device_id().is_none());

        let event = CoreEvent::DeviceStatusChanged {
            device_id: "d-9".to_string(),
            status: DeviceStatus::Active,
        };
        assert_eq!(event.device_id(), Some("d-9"));
    }
}
