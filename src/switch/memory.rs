//! In-process switch implementation
//!
//! Backs tests and single-host deployments: a rule table, per-MAC traffic
//! counters fed by `inject_packet`, and observation fan-out. Counters are
//! windowed — each `get_flow_stats` call drains the window.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::models::{FlowTotals, PacketObservation, RuleMatch};

use super::adapter::{BoxFuture, ObservationCallback, RuleAction, RuleSpec, SwitchControl};

/// Tie-break at equal priority: deny wins over redirection, redirection
/// over observation, observation over plain forwarding.
fn action_rank(action: RuleAction) -> u8 {
    match action {
        RuleAction::Drop => 3,
        RuleAction::Output(_) => 2,
        RuleAction::Monitor => 1,
        RuleAction::Forward => 0,
    }
}

#[derive(Default)]
struct TrafficWindow {
    packets: u64,
    bytes: u64,
    dst_ips: BTreeSet<String>,
    dst_ports: BTreeSet<u16>,
    protocols: BTreeSet<String>,
    started: Option<Instant>,
}

/// Switch backed by process memory.
pub struct InMemorySwitch {
    rules: StdMutex<HashMap<String, RuleSpec>>,
    windows: StdMutex<HashMap<String, TrafficWindow>>,
    observers: StdMutex<Vec<ObservationCallback>>,
    available: AtomicBool,
    install_count: StdMutex<u64>,
}

impl InMemorySwitch {
    pub fn new() -> Self {
        Self {
            rules: StdMutex::new(HashMap::new()),
            windows: StdMutex::new(HashMap::new()),
            observers: StdMutex::new(Vec::new()),
            available: AtomicBool::new(true),
            install_count: StdMutex::new(0),
        }
    }

    /// Simulate a data-plane outage; all operations fail until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Total successful rule installs, for idempotency assertions.
    pub fn install_count(&self) -> u64 {
        *self.install_count.lock().expect("install counter poisoned")
    }

    /// Feed one packet through the switch: counters update and observers
    /// fire, exactly as a mirrored packet would behave.
    pub fn inject_packet(
        &self,
        mac: &str,
        size: u64,
        protocol: &str,
        dst_ip: Option<&str>,
        dst_port: Option<u16>,
    ) {
        {
            let mut windows = self.windows.lock().expect("traffic windows poisoned");
            let window = windows.entry(mac.to_string()).or_default();
            window.packets += 1;
            window.bytes += size;
            if let Some(ip) = dst_ip {
                window.dst_ips.insert(ip.to_string());
            }
            if let Some(port) = dst_port {
                window.dst_ports.insert(port);
            }
            window.protocols.insert(protocol.to_string());
            window.started.get_or_insert_with(Instant::now);
        }

        let observation = PacketObservation {
            mac: mac.to_string(),
            timestamp: Utc::now(),
            size,
            protocol: protocol.to_string(),
            src_port: None,
            dst_port,
            dst_ip: dst_ip.map(str::to_string),
        };
        let observers = self.observers.lock().expect("observers poisoned");
        for observer in observers.iter() {
            observer(observation.clone());
        }
    }

    /// Rules currently matching a MAC, in match order: descending
    /// priority, with deny > redirect > monitor > forward breaking ties.
    pub fn rules_for_mac(&self, mac: &str) -> Vec<RuleSpec> {
        let rules = self.rules.lock().expect("rule table poisoned");
        let mut matching: Vec<RuleSpec> = rules
            .values()
            .filter(|r| r.matches.eth_src.as_deref() == Some(mac))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| action_rank(b.action).cmp(&action_rank(a.action)))
        });
        matching
    }

    /// Rules matching a source IP (mitigation rules).
    pub fn rules_for_src_ip(&self, src_ip: &str) -> Vec<RuleSpec> {
        let rules = self.rules.lock().expect("rule table poisoned");
        rules
            .values()
            .filter(|r| r.matches.src_ip.as_deref() == Some(src_ip))
            .cloned()
            .collect()
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CoreError::SwitchUnavailable)
        }
    }
}

impl Default for InMemorySwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchControl for InMemorySwitch {
    fn install_rule<'a>(&'a self, rule: RuleSpec) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            if rule.matches == RuleMatch::default()
                && !matches!(rule.action, RuleAction::Drop)
            {
                return Err(CoreError::SwitchRuleRejected {
                    reason: "wildcard match requires drop action".to_string(),
                });
            }
            debug!(
                "[SWITCH] install {} prio={} action={:?}",
                rule.rule_id, rule.priority, rule.action
            );
            let mut rules = self.rules.lock().expect("rule table poisoned");
            rules.insert(rule.rule_id.clone(), rule);
            *self.install_count.lock().expect("install counter poisoned") += 1;
            Ok(())
        })
    }

    fn remove_rule<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            let mut rules = self.rules.lock().expect("rule table poisoned");
            rules.remove(rule_id);
            Ok(())
        })
    }

    fn list_rules<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<RuleSpec>>> {
        Box::pin(async move {
            self.check_available()?;
            let rules = self.rules.lock().expect("rule table poisoned");
            Ok(rules.values().cloned().collect())
        })
    }

    fn get_flow_stats<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<FlowTotals>>> {
        Box::pin(async move {
            self.check_available()?;
            let mut windows = self.windows.lock().expect("traffic windows poisoned");
            let mut totals = Vec::with_capacity(windows.len());
            for (mac, window) in windows.iter_mut() {
                let elapsed = window
                    .started
                    .map(|s| s.elapsed().as_secs().max(1))
                    .unwrap_or(1);
                totals.push(FlowTotals {
                    mac: mac.clone(),
                    packets: window.packets,
                    bytes: window.bytes,
                    dst_ips: window.dst_ips.iter().cloned().collect(),
                    dst_ports: window.dst_ports.iter().copied().collect(),
                    protocols: window.protocols.iter().cloned().collect(),
                    window_seconds: elapsed,
                });
                *window = TrafficWindow::default();
            }
            Ok(totals)
        })
    }

    fn record_observation(&self, callback: ObservationCallback) {
        let mut observers = self.observers.lock().expect("observers poisoned");
        observers.push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_inject_accumulates_window_and_drains_on_read() {
        let switch = InMemorySwitch::new();
        for _ in 0..10 {
            switch.inject_packet("aa:bb:cc:00:00:01", 100, "tcp", Some("10.0.0.10"), Some(443));
        }

        let stats = switch.get_flow_stats().await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].packets, 10);
        assert_eq!(stats[0].bytes, 1000);
        assert_eq!(stats[0].dst_ips, vec!["10.0.0.10".to_string()]);
        assert_eq!(stats[0].dst_ports, vec![443]);

        // Window drained.
        let stats = switch.get_flow_stats().await.expect("stats");
        assert_eq!(stats[0].packets, 0);
    }

    #[tokio::test]
    async fn test_observers_see_injected_packets() {
        let switch = InMemorySwitch::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        switch.record_observation(Arc::new(move |obs| {
            assert_eq!(obs.mac, "aa:bb:cc:00:00:01");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        switch.inject_packet("aa:bb:cc:00:00:01", 64, "udp", None, Some(53));
        switch.inject_packet("aa:bb:cc:00:00:01", 64, "udp", None, Some(53));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_switch_errors() {
        let switch = InMemorySwitch::new();
        switch.set_available(false);

        let err = switch
            .install_rule(RuleSpec {
                rule_id: "r-1".to_string(),
                matches: RuleMatch::eth_src("aa:bb:cc:00:00:01"),
                action: RuleAction::Drop,
                priority: 200,
            })
            .await
            .expect_err("must fail while down");
        assert_eq!(err.kind(), "switch_unavailable");
    }
}
