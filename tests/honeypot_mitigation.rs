//! Honeypot intelligence becomes mitigation rules, survives restarts,
//! and replayed threats install exactly once.

mod common;

use std::io::Write;

use common::{build_core, build_core_with};
use trustplane::honeypot::mitigation::rule_for_threat;
use trustplane::{CoreEvent, Database, PolicyAction, RuleAction, Severity};

#[tokio::test]
async fn test_login_success_becomes_permanent_deny() {
    let core = build_core();

    {
        let mut file = std::fs::File::create(&core.log_path).expect("log file");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"login_success","src_ip":"198.51.100.7","username":"root","password":"123456"}}"#
        )
        .expect("write");
    }

    let ingested = core.app.ingestor.ingest_new_lines().await.expect("ingest");
    assert_eq!(ingested, 1);

    let threat = core
        .app
        .store
        .get_threat("198.51.100.7")
        .expect("query")
        .expect("threat recorded");
    assert_eq!(threat.severity, Severity::High);

    // The generator's mapping for a high threat.
    let rule = rule_for_threat("198.51.100.7", threat.severity);
    assert_eq!(rule.action, PolicyAction::Deny);
    assert_eq!(rule.priority, 200);
    assert!(rule.permanent);

    core.app
        .orchestrator
        .handle_event(CoreEvent::MitigationProposed(rule))
        .await
        .expect("install");

    let installed = core.switch.rules_for_src_ip("198.51.100.7");
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].action, RuleAction::Drop);
    assert_eq!(installed[0].priority, 200);

    let persisted = core.app.store.list_mitigations().expect("list");
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].permanent);
}

#[tokio::test]
async fn test_permanent_rule_survives_restart() {
    let db = Database::in_memory().expect("db");
    let first = build_core_with(db.clone());

    let rule = rule_for_threat("198.51.100.7", Severity::High);
    first
        .app
        .orchestrator
        .handle_event(CoreEvent::MitigationProposed(rule))
        .await
        .expect("install");
    drop(first);

    // Same database, fresh process state and a fresh switch.
    let second = build_core_with(db);
    assert!(second.switch.rules_for_src_ip("198.51.100.7").is_empty());

    second.app.orchestrator.restore().await.expect("restore");
    let installed = second.switch.rules_for_src_ip("198.51.100.7");
    assert_eq!(installed.len(), 1, "permanent mitigation reinstalled");
    assert_eq!(installed[0].action, RuleAction::Drop);
}

#[tokio::test]
async fn test_replayed_threat_installs_exactly_once() {
    let core = build_core();

    let before = core.switch.install_count();
    for _ in 0..1000 {
        let rule = rule_for_threat("198.51.100.7", Severity::High);
        core.app
            .orchestrator
            .handle_event(CoreEvent::MitigationProposed(rule))
            .await
            .expect("handled");
    }

    assert_eq!(
        core.switch.install_count() - before,
        1,
        "one install for a thousand replays"
    );
    assert_eq!(core.app.orchestrator.installed_mitigation_count(), 1);
    assert_eq!(
        core.app.store.list_mitigations().expect("list").len(),
        1,
        "exactly one rule for that source"
    );

    let epoch = chrono::DateTime::from_timestamp(0, 0).expect("epoch");
    let audit = core.app.store.audit_since(epoch).expect("audit");
    let installs = audit
        .iter()
        .filter(|a| a.device_id == "mitigation:198.51.100.7")
        .count();
    assert_eq!(installs, 1, "one audit entry for the single install");
}

#[tokio::test]
async fn test_medium_threat_redirects_and_expires_with_threat() {
    let core = build_core();

    {
        let mut file = std::fs::File::create(&core.log_path).expect("log file");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"command_execution","src_ip":"203.0.113.9","command":"uname -a"}}"#
        )
        .expect("write");
    }
    core.app.ingestor.ingest_new_lines().await.expect("ingest");

    let threat = core
        .app
        .store
        .get_threat("203.0.113.9")
        .expect("query")
        .expect("threat");
    assert_eq!(threat.severity, Severity::Medium);

    let rule = rule_for_threat("203.0.113.9", threat.severity);
    assert!(!rule.permanent);
    core.app
        .orchestrator
        .handle_event(CoreEvent::MitigationProposed(rule.clone()))
        .await
        .expect("install");
    assert_eq!(
        core.switch.rules_for_src_ip("203.0.113.9")[0].action,
        RuleAction::Output(3),
        "medium threats redirect to the honeypot"
    );

    // Age the threat out: non-permanent mitigations expire with it.
    let stale = trustplane::Threat {
        last_seen: chrono::Utc::now() - chrono::Duration::days(2),
        ..threat
    };
    core.app.store.upsert_threat(&stale).expect("backdate");
    let removed = core.app.ingestor.reap_stale_threats().await.expect("reap");
    assert_eq!(removed, 1);

    core.app
        .orchestrator
        .handle_event(CoreEvent::MitigationExpired {
            rule_id: rule.rule_id.clone(),
        })
        .await
        .expect("expire");
    assert!(core.switch.rules_for_src_ip("203.0.113.9").is_empty());
    assert!(core.app.store.list_mitigations().expect("list").is_empty());
}

#[tokio::test]
async fn test_destructive_command_escalates_to_permanent_block() {
    let core = build_core();

    {
        let mut file = std::fs::File::create(&core.log_path).expect("log file");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"command_execution","src_ip":"203.0.113.20","command":"rm -rf /etc"}}"#
        )
        .expect("write");
    }
    core.app.ingestor.ingest_new_lines().await.expect("ingest");

    let threat = core
        .app
        .store
        .get_threat("203.0.113.20")
        .expect("query")
        .expect("threat");
    assert_eq!(threat.severity, Severity::High, "destructive command escalates");
}

#[tokio::test]
async fn test_managed_device_hitting_honeypot_loses_trust() {
    let core = build_core();
    let mac = "aa:bb:cc:00:00:09";
    common::onboard_active_device(&core, "D9", mac).await;

    // The device's address attacks the honeypot.
    {
        let mut file = std::fs::File::create(&core.log_path).expect("log file");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"login_success","src_ip":"192.168.1.50"}}"#
        )
        .expect("write");
    }
    core.app.ingestor.ingest_new_lines().await.expect("ingest");

    assert_eq!(
        core.app.scorer.get("D9"),
        Some(30),
        "high honeypot hit costs forty"
    );
}
