//! A revoked certificate fails attestation, drains trust, and ends in
//! quarantine with the device cut off.

mod common;

use common::{build_core, onboard_active_device};
use trustplane::{Decision, RuleAction};

#[tokio::test]
async fn test_revoked_certificate_cascades_to_quarantine() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:01";
    onboard_active_device(&core, "D1", mac).await;

    core.app
        .orchestrator
        .reevaluate("D1", "test")
        .await
        .expect("reevaluate");
    assert_eq!(core.app.orchestrator.last_installed("D1"), Some(Decision::Allow));

    // Pre-damaged trust sitting exactly at the quarantine boundary.
    core.app
        .scorer
        .adjust("D1", -40, "prior incidents")
        .await
        .expect("adjust");
    assert_eq!(core.app.scorer.get("D1"), Some(30));

    // The certificate is revoked out-of-band.
    core.app.ca.revoke("D1", "key compromise reported").expect("revoke");

    // Next attestation cycle fails: 30 - 20 clamps into quarantine range.
    let failures = core.app.attestation.attest_all().await.expect("cycle");
    assert_eq!(failures, 1);
    assert_eq!(core.app.scorer.get("D1"), Some(10));

    core.app
        .orchestrator
        .reevaluate("D1", "attestation")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D1"),
        Some(Decision::Quarantine)
    );

    // Top-of-table isolation rule, allow rules gone.
    let rules = core.switch.rules_for_mac(mac);
    let quarantine = rules
        .iter()
        .find(|r| r.rule_id == "dev-D1-quarantine")
        .expect("quarantine rule installed");
    assert_eq!(quarantine.priority, 65535);
    assert_eq!(quarantine.action, RuleAction::Output(4), "quarantine port configured");
    assert!(
        !rules.iter().any(|r| r.rule_id.starts_with("dev-D1-policy-")),
        "allow rules removed"
    );

    // Operator audit trail shows the transition.
    let epoch = chrono::DateTime::from_timestamp(0, 0).expect("epoch");
    let audit = core.app.store.audit_since(epoch).expect("audit");
    let entry = audit
        .iter()
        .rev()
        .find(|a| a.device_id == "D1")
        .expect("audit entry");
    assert_eq!(entry.decision, Decision::Quarantine);
    assert_eq!(entry.prev_decision, Some(Decision::Allow));
    assert!(!entry.correlation_id.is_empty());

    // The trust history carries the attestation reason.
    let history = core.app.store.trust_history("D1", 10).expect("history");
    assert!(history
        .iter()
        .any(|e| e.reason.contains("attestation_fail") && e.delta == -20));
}

#[tokio::test]
async fn test_quarantine_release_requires_admin_and_reevaluates() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:02";
    onboard_active_device(&core, "D2", mac).await;

    // Collapse trust entirely.
    core.app.scorer.adjust("D2", -60, "incident").await.expect("adjust");
    core.app
        .orchestrator
        .reevaluate("D2", "test")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D2"),
        Some(Decision::Quarantine)
    );

    // Trust recovers past every floor, but quarantine holds without an
    // administrator.
    core.app.scorer.adjust("D2", 80, "remediated").await.expect("adjust");
    core.app
        .orchestrator
        .reevaluate("D2", "test")
        .await
        .expect("reevaluate");
    assert_eq!(
        core.app.orchestrator.last_installed("D2"),
        Some(Decision::Quarantine),
        "no silent exit from quarantine"
    );

    core.app
        .orchestrator
        .release_quarantine("D2")
        .await
        .expect("release");
    assert_eq!(
        core.app.orchestrator.last_installed("D2"),
        Some(Decision::Allow)
    );
}
