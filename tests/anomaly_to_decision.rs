//! Scan anomalies degrade a device from allow through redirect to deny.

mod common;

use chrono::Utc;
use common::{build_core, onboard_active_device};
use trustplane::{AlertKind, CoreEvent, Decision, FlowSample, RuleAction, Severity};

fn sample(device_id: &str, mac: &str, pps: f64, ips: usize, ports: usize) -> FlowSample {
    FlowSample {
        device_id: device_id.to_string(),
        mac: mac.to_string(),
        pps,
        bps: pps * 100.0,
        unique_dst_ips: ips,
        unique_dst_ports: ports,
        protocols: vec!["tcp".to_string()],
        window_seconds: 10,
        sampled_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_port_scan_walks_device_down_the_ladder() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:01";
    onboard_active_device(&core, "D1", mac).await;

    core.app
        .orchestrator
        .reevaluate("D1", "test")
        .await
        .expect("reevaluate");
    assert_eq!(core.app.orchestrator.last_installed("D1"), Some(Decision::Allow));

    // A port sweep: 15 unique destination ports against a baseline of 1.
    let raised = core
        .app
        .detector
        .handle_sample(&sample("D1", mac, 0.2, 1, 15))
        .await
        .expect("handled");
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].kind, AlertKind::PortScan);
    assert_eq!(raised[0].severity, Severity::Medium);

    // Medium behavioral anomaly costs 15: 70 -> 55.
    assert_eq!(core.app.scorer.get("D1"), Some(55));

    core.app
        .orchestrator
        .handle_event(CoreEvent::AlertRaised(raised[0].clone()))
        .await
        .expect("handle alert");
    assert_eq!(
        core.app.orchestrator.last_installed("D1"),
        Some(Decision::Redirect),
        "trust below 70 redirects to the honeypot"
    );
    let rules = core.switch.rules_for_mac(mac);
    let redirect = rules
        .iter()
        .find(|r| r.rule_id == "dev-D1-redirect")
        .expect("redirect rule installed");
    assert_eq!(redirect.action, RuleAction::Output(3));
    assert_eq!(redirect.priority, 150);

    // A second anomaly (network sweep this time): 55 -> 40, below 50.
    let raised = core
        .app
        .detector
        .handle_sample(&sample("D1", mac, 0.2, 20, 1))
        .await
        .expect("handled");
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].kind, AlertKind::NetworkScan);
    assert_eq!(core.app.scorer.get("D1"), Some(40));

    core.app
        .orchestrator
        .handle_event(CoreEvent::AlertRaised(raised[0].clone()))
        .await
        .expect("handle alert");
    assert_eq!(
        core.app.orchestrator.last_installed("D1"),
        Some(Decision::Deny),
        "trust below 50 denies"
    );
    let rules = core.switch.rules_for_mac(mac);
    let deny = rules
        .iter()
        .find(|r| r.rule_id == "dev-D1-deny")
        .expect("deny rule installed");
    assert_eq!(deny.action, RuleAction::Drop);
    assert_eq!(deny.priority, 200);
    assert!(
        !rules.iter().any(|r| r.rule_id == "dev-D1-redirect"),
        "redirect rule replaced"
    );
}

#[tokio::test]
async fn test_alert_always_has_matching_trust_delta() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:02";
    onboard_active_device(&core, "D2", mac).await;

    let raised = core
        .app
        .detector
        .handle_sample(&sample("D2", mac, 0.2, 1, 15))
        .await
        .expect("handled");
    assert_eq!(raised.len(), 1);

    let history = core.app.store.trust_history("D2", 10).expect("history");
    let matching = history
        .iter()
        .find(|e| e.reason.contains("port_scan"))
        .expect("trust delta recorded for the alert");
    assert_eq!(matching.delta, -15);
    let gap = (matching.created_at - raised[0].created_at).num_seconds().abs();
    assert!(gap <= 1, "delta within one second of the alert");
}

#[tokio::test]
async fn test_recovery_requires_hysteresis_and_quiet_window() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:03";
    onboard_active_device(&core, "D3", mac).await;

    core.app
        .orchestrator
        .reevaluate("D3", "test")
        .await
        .expect("reevaluate");

    // Degrade to redirect.
    let raised = core
        .app
        .detector
        .handle_sample(&sample("D3", mac, 0.2, 1, 15))
        .await
        .expect("handled");
    core.app
        .orchestrator
        .handle_event(CoreEvent::AlertRaised(raised[0].clone()))
        .await
        .expect("handle alert");
    assert_eq!(
        core.app.orchestrator.last_installed("D3"),
        Some(Decision::Redirect)
    );

    // Trust climbs back to 73: above 70 but inside hysteresis, and the
    // medium alert is still inside the recovery window.
    core.app.scorer.adjust("D3", 18, "manual credit").await.expect("adjust");
    core.app
        .orchestrator
        .reevaluate("D3", "test")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D3"),
        Some(Decision::Redirect),
        "recovery gated while the alert is fresh and trust under 75"
    );

    // Even past the trust floor, the recent medium alert still gates.
    core.app.scorer.adjust("D3", 10, "manual credit").await.expect("adjust");
    core.app
        .orchestrator
        .reevaluate("D3", "test")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D3"),
        Some(Decision::Redirect),
        "quiet window required before recovery"
    );
}
