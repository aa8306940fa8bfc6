//! Mitigation generator
//!
//! Turns confirmed threats into forwarding rules: block the worst,
//! deceive the middling, watch the rest. Rules are proposed to the
//! orchestrator, which owns installation and deduplication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::bus::{CoreEvent, EventBus};
use crate::models::{MitigationRule, PolicyAction, RuleMatch, Severity};

/// Build the mitigation rule for a threat at the given severity.
pub fn rule_for_threat(source_ip: &str, severity: Severity) -> MitigationRule {
    let (action, priority, permanent) = match severity {
        Severity::High | Severity::Critical => (PolicyAction::Deny, 200, true),
        Severity::Medium => (PolicyAction::Redirect, 150, false),
        Severity::Low => (PolicyAction::Monitor, 100, false),
    };

    MitigationRule {
        rule_id: format!("mit-{}", source_ip),
        matches: RuleMatch::src_ip(source_ip),
        action,
        priority,
        reason: format!("honeypot threat severity {}", severity),
        origin_threat: source_ip.to_string(),
        permanent,
        created_at: Utc::now(),
    }
}

/// Subscribes to threat updates and proposes mitigation rules.
pub struct MitigationGenerator {
    bus: EventBus,
    running: Arc<AtomicBool>,
}

impl MitigationGenerator {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generator = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            info!("[MITIGATE] Mitigation generator started");
            while generator.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Some(CoreEvent::ThreatUpdated {
                        source_ip,
                        severity,
                    }) => {
                        let rule = rule_for_threat(&source_ip, severity);
                        info!(
                            "[MITIGATE] {} for {} (prio {}, permanent={})",
                            rule.action, source_ip, rule.priority, rule.permanent
                        );
                        generator.bus.publish(CoreEvent::MitigationProposed(rule));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            info!("[MITIGATE] Mitigation generator stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_to_rule_mapping() {
        let rule = rule_for_threat("198.51.100.7", Severity::High);
        assert_eq!(rule.action, PolicyAction::Deny);
        assert_eq!(rule.priority, 200);
        assert!(rule.permanent);
        assert_eq!(rule.matches.src_ip.as_deref(), Some("198.51.100.7"));

        let rule = rule_for_threat("198.51.100.7", Severity::Medium);
        assert_eq!(rule.action, PolicyAction::Redirect);
        assert_eq!(rule.priority, 150);
        assert!(!rule.permanent);

        let rule = rule_for_threat("198.51.100.7", Severity::Low);
        assert_eq!(rule.action, PolicyAction::Monitor);
        assert_eq!(rule.priority, 100);
        assert!(!rule.permanent);
    }

    #[test]
    fn test_rule_id_is_stable_per_source() {
        let a = rule_for_threat("198.51.100.7", Severity::High);
        let b = rule_for_threat("198.51.100.7", Severity::Critical);
        assert_eq!(a.rule_id, b.rule_id, "one rule per source IP");
    }
}
