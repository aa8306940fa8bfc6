//! Threat intelligence accumulation
//!
//! Pure folding logic for the threat table: severity mapping per event
//! kind, malicious-command escalation, and per-source accumulation.

use chrono::{DateTime, Utc};

use crate::models::{Severity, Threat};

/// Commands that escalate a command-execution event to high severity.
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "rm", "dd", "mkfs", "format", "shutdown", "reboot", "delete",
];

/// Map a honeypot event id to its severity. Unknown kinds return `None`
/// and the record is skipped. Both the generic names and the cowrie
/// event ids are accepted.
pub fn severity_for_event(eventid: &str, command: Option<&str>) -> Option<Severity> {
    let base = match eventid {
        "login_success" | "cowrie.login.success" => Severity::High,
        "file_download" | "cowrie.session.file_download" => Severity::High,
        "malware_exec" => Severity::High,
        "command_execution" | "cowrie.command.input" => Severity::Medium,
        "repeated_login_attempts" => Severity::Medium,
        "login_attempt" | "cowrie.login.failed" => Severity::Low,
        "port_probe" | "cowrie.session.connect" => Severity::Low,
        _ => return None,
    };

    // A destructive command in the session transcript is as bad as a
    // successful login.
    if base == Severity::Medium {
        if let Some(command) = command {
            let lowered = command.to_lowercase();
            if DESTRUCTIVE_KEYWORDS
                .iter()
                .any(|kw| lowered.split_whitespace().any(|tok| tok == *kw))
            {
                return Some(Severity::High);
            }
        }
    }

    Some(base)
}

/// Fold one event into the threat record for its source IP: first_seen
/// is preserved, last_seen extends, event kinds accumulate, and severity
/// only ever rises.
pub fn fold_event(
    existing: Option<Threat>,
    source_ip: &str,
    eventid: &str,
    severity: Severity,
    observed_at: DateTime<Utc>,
) -> Threat {
    match existing {
        Some(mut threat) => {
            threat.last_seen = threat.last_seen.max(observed_at);
            if !threat.event_kinds.iter().any(|k| k == eventid) {
                threat.event_kinds.push(eventid.to_string());
            }
            threat.severity = threat.severity.max(severity);
            threat
        }
        None => Threat {
            source_ip: source_ip.to_string(),
            first_seen: observed_at,
            last_seen: observed_at,
            event_kinds: vec![eventid.to_string()],
            severity,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_severity_mapping() {
        assert_eq!(severity_for_event("login_success", None), Some(Severity::High));
        assert_eq!(
            severity_for_event("cowrie.login.success", None),
            Some(Severity::High)
        );
        assert_eq!(
            severity_for_event("command_execution", Some("ls -la")),
            Some(Severity::Medium)
        );
        assert_eq!(severity_for_event("port_probe", None), Some(Severity::Low));
        assert_eq!(severity_for_event("heartbeat", None), None);
    }

    #[test]
    fn test_destructive_command_escalates() {
        assert_eq!(
            severity_for_event("command_execution", Some("rm -rf /")),
            Some(Severity::High)
        );
        assert_eq!(
            severity_for_event("cowrie.command.input", Some("dd if=/dev/zero of=/dev/sda")),
            Some(Severity::High)
        );
        // Substrings inside other words do not trigger.
        assert_eq!(
            severity_for_event("command_execution", Some("echo performance")),
            Some(Severity::Medium)
        );
    }

    #[test]
    fn test_fold_accumulates_and_escalates() {
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = Utc::now();

        let threat = fold_event(None, "198.51.100.7", "login_attempt", Severity::Low, t0);
        assert_eq!(threat.severity, Severity::Low);
        assert_eq!(threat.first_seen, t0);

        let threat = fold_event(
            Some(threat),
            "198.51.100.7",
            "login_success",
            Severity::High,
            t1,
        );
        assert_eq!(threat.severity, Severity::High);
        assert_eq!(threat.first_seen, t0, "first_seen immutable");
        assert_eq!(threat.last_seen, t1);
        assert_eq!(threat.event_kinds.len(), 2);

        // Severity never decays from later low events.
        let threat = fold_event(
            Some(threat),
            "198.51.100.7",
            "port_probe",
            Severity::Low,
            t1,
        );
        assert_eq!(threat.severity, Severity::High);
    }
}
