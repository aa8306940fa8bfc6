//! Happy-path onboarding: approval, profiling traffic, finalization,
//! and the resulting allow decision.

mod common;

use common::{build_core, onboard_active_device};
use trustplane::{Decision, DeviceStatus, PolicyAction, RuleAction};

#[tokio::test]
async fn test_full_onboarding_yields_baseline_policy_and_allow() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:01";

    core.app
        .store
        .register_pending(mac, Some("D1"), Some("sensor"))
        .await
        .expect("register");
    let device = core
        .app
        .coordinator
        .approve("D1", "known vendor, expected device")
        .await
        .expect("approve");
    assert_eq!(device.status, DeviceStatus::Profiling);

    // Certificate issued and valid.
    let outcome = core.app.ca.validate_device_file("D1").expect("validate");
    assert!(outcome.is_valid());

    // Trust seeded at the initial value.
    assert_eq!(core.app.scorer.get("D1"), Some(70));

    // Permissive observation rule in place for the profiling window.
    let rules = core.switch.rules_for_mac(mac);
    assert!(
        rules.iter().any(|r| r.rule_id == "obs-D1" && r.action == RuleAction::Forward),
        "observation rule installed"
    );

    // Before finalization there is no baseline and no policy.
    assert!(core.app.store.get_baseline("D1").await.expect("query").is_none());
    assert!(core.app.store.get_policy("D1").await.expect("query").is_none());

    // 100 observations toward one service.
    for _ in 0..100 {
        core.switch.inject_packet(mac, 120, "tcp", Some("10.0.0.10"), Some(443));
    }
    core.app
        .store
        .set_profiling_started("D1", chrono::Utc::now() - chrono::Duration::seconds(300))
        .await
        .expect("backdate");

    let baseline = core.app.coordinator.finalize("D1").await.expect("finalize");
    assert!(baseline.avg_bps > 0.0);
    assert_eq!(baseline.dst_ips, vec!["10.0.0.10".to_string()]);
    assert_eq!(baseline.dst_ports, vec![443]);
    assert!(!baseline.sparse, "100 packets is plenty");
    assert_eq!(baseline.protocols, vec!["tcp".to_string()]);

    // Least-privilege policy: allow the observed ip and port, then deny.
    let policy = core
        .app
        .store
        .get_policy("D1")
        .await
        .expect("query")
        .expect("policy exists");
    assert_eq!(policy.rules.len(), 3);
    assert_eq!(policy.rules[0].matches.dst_ip.as_deref(), Some("10.0.0.10"));
    assert_eq!(policy.rules[0].action, PolicyAction::Allow);
    assert_eq!(policy.rules[0].priority, 100);
    assert_eq!(policy.rules[1].matches.dst_port, Some(443));
    assert_eq!(policy.rules[1].priority, 100);
    assert!(policy.ends_with_default_deny());

    // Trust unchanged by a clean profiling run; decision is ALLOW.
    assert_eq!(core.app.scorer.get("D1"), Some(70));
    core.app
        .orchestrator
        .reevaluate("D1", "test")
        .await
        .expect("reevaluate");
    assert_eq!(core.app.orchestrator.last_installed("D1"), Some(Decision::Allow));

    // The stored policy is what reached the switch, observation rule gone.
    let rules = core.switch.rules_for_mac(mac);
    assert!(!rules.iter().any(|r| r.rule_id == "obs-D1"));
    assert_eq!(
        rules.iter().filter(|r| r.rule_id.starts_with("dev-D1-policy-")).count(),
        3
    );
}

#[tokio::test]
async fn test_sparse_profiling_still_finalizes() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:02";

    core.app
        .store
        .register_pending(mac, Some("D2"), None)
        .await
        .expect("register");
    core.app.coordinator.approve("D2", "ok").await.expect("approve");

    // Only two packets before the window elapses.
    core.switch.inject_packet(mac, 60, "udp", Some("10.0.0.53"), Some(53));
    core.switch.inject_packet(mac, 60, "udp", Some("10.0.0.53"), Some(53));

    let baseline = core.app.coordinator.finalize("D2").await.expect("finalize");
    assert!(baseline.sparse, "under min_packets marks the baseline sparse");

    let device = core.app.store.get_device("D2").await.expect("device");
    assert_eq!(device.status, DeviceStatus::Active);
}

#[tokio::test]
async fn test_finalize_twice_conflicts() {
    let core = build_core();
    onboard_active_device(&core, "D3", "aa:bb:cc:00:00:03").await;

    let err = core
        .app
        .coordinator
        .finalize("D3")
        .await
        .expect_err("second finalize must fail");
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn test_reject_never_issues_certificate() {
    let core = build_core();
    core.app
        .store
        .register_pending("aa:bb:cc:00:00:04", Some("D4"), None)
        .await
        .expect("register");
    core.app
        .coordinator
        .reject("D4", "unrecognized vendor prefix")
        .await
        .expect("reject");

    let device = core.app.store.get_device("D4").await.expect("device");
    assert_eq!(device.status, DeviceStatus::Revoked);
    assert!(device.cert_path.is_none());

    // Revoked devices never get ALLOW.
    core.app
        .orchestrator
        .reevaluate("D4", "test")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D4"),
        Some(Decision::Quarantine)
    );
}
