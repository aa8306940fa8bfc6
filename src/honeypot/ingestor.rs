//! Honeypot log ingestor
//!
//! Tails the newline-delimited JSON event stream written by the honeypot
//! and maintains the threat table. Each tick also ages out threats not
//! seen within the TTL, expiring their non-permanent mitigations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::honeypot::threats::{fold_event, severity_for_event};
use crate::identity::IdentityStore;
use crate::models::{Alert, AlertKind, Severity};
use crate::trust::scorer::delta_for_alert;
use crate::trust::TrustScorer;

const TAIL_INTERVAL: Duration = Duration::from_secs(2);

/// One parsed honeypot record. Unknown fields are ignored; records
/// missing any required field are skipped without error.
#[derive(Debug, Clone, Deserialize)]
pub struct HoneypotRecord {
    pub timestamp: String,
    pub eventid: String,
    pub src_ip: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub struct HoneypotIngestor {
    store: Arc<IdentityStore>,
    scorer: Arc<TrustScorer>,
    bus: EventBus,
    config: Arc<CoreConfig>,
    log_path: PathBuf,
    offset: AtomicU64,
    events_ingested: AtomicU64,
    running: Arc<AtomicBool>,
}

impl HoneypotIngestor {
    pub fn new(
        store: Arc<IdentityStore>,
        scorer: Arc<TrustScorer>,
        bus: EventBus,
        config: Arc<CoreConfig>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            store,
            scorer,
            bus,
            config,
            log_path,
            offset: AtomicU64::new(0),
            events_ingested: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events_ingested(&self) -> u64 {
        self.events_ingested.load(Ordering::Relaxed)
    }

    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "[HONEYPOT] Tailing {} (threat TTL {}s)",
                ingestor.log_path.display(),
                ingestor.config.threat_ttl_s
            );
            while ingestor.running.load(Ordering::SeqCst) {
                if let Err(err) = ingestor.ingest_new_lines().await {
                    warn!("[HONEYPOT] Ingest tick failed: {}", err);
                }
                if let Err(err) = ingestor.reap_stale_threats().await {
                    warn!("[HONEYPOT] Threat aging failed: {}", err);
                }
                tokio::time::sleep(TAIL_INTERVAL).await;
            }
            info!("[HONEYPOT] Ingestor stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Read any bytes appended since the previous tick and process each
    /// complete line. A truncated (rotated) file restarts from zero.
    pub async fn ingest_new_lines(&self) -> CoreResult<usize> {
        let content = match tokio::fs::read(&self.log_path).await {
            Ok(content) => content,
            // A honeypot that has not written yet is not an error.
            Err(_) => return Ok(0),
        };

        let previous = self.offset.load(Ordering::SeqCst);
        let start = if (content.len() as u64) < previous {
            debug!("[HONEYPOT] Log truncated, restarting from head");
            0usize
        } else {
            previous as usize
        };

        let new_bytes = &content[start..];
        // Only consume up to the last complete line.
        let consumed = match new_bytes.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(0),
        };

        let mut ingested = 0usize;
        for line in String::from_utf8_lossy(&new_bytes[..consumed]).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HoneypotRecord>(line) {
                Ok(record) => {
                    if self.process_record(&record).await? {
                        ingested += 1;
                    }
                }
                Err(_) => {
                    // Unknown or malformed records are skipped by contract.
                    debug!("[HONEYPOT] Skipping unparseable record");
                }
            }
        }

        self.offset
            .store((start + consumed) as u64, Ordering::SeqCst);
        self.events_ingested
            .fetch_add(ingested as u64, Ordering::Relaxed);
        Ok(ingested)
    }

    /// Fold one record into the threat table. Returns false when the
    /// event kind is unknown.
    pub async fn process_record(&self, record: &HoneypotRecord) -> CoreResult<bool> {
        let Some(severity) = severity_for_event(&record.eventid, record.command.as_deref())
        else {
            return Ok(false);
        };

        let observed_at = DateTime::parse_from_rfc3339(&record.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let existing = self.store.get_threat(&record.src_ip)?;
        let threat = fold_event(
            existing,
            &record.src_ip,
            &record.eventid,
            severity,
            observed_at,
        );
        self.store.upsert_threat(&threat)?;

        debug!(
            "[HONEYPOT] {} -> {} ({})",
            record.src_ip, record.eventid, threat.severity
        );
        self.bus.publish(CoreEvent::ThreatUpdated {
            source_ip: threat.source_ip.clone(),
            severity: threat.severity,
        });

        // A managed device attacking the honeypot is itself compromised.
        // Low-severity hits carry no trust penalty, and every published
        // alert must land a delta in the device's history, so those stay
        // in the threat table only.
        if delta_for_alert(AlertKind::HoneypotHit, threat.severity).is_some() {
            if let Some(device) = self.device_for_ip(&record.src_ip).await? {
                self.scorer
                    .record_alert(&device.device_id, AlertKind::HoneypotHit, threat.severity)
                    .await?;
                self.bus.publish(CoreEvent::AlertRaised(Alert::new(
                    device.device_id.clone(),
                    AlertKind::HoneypotHit,
                    threat.severity,
                    format!("honeypot {} from {}", record.eventid, record.src_ip),
                )));
            }
        }

        Ok(true)
    }

    async fn device_for_ip(
        &self,
        ip: &str,
    ) -> CoreResult<Option<crate::models::Device>> {
        let devices = self.store.list_devices().await?;
        Ok(devices
            .into_iter()
            .find(|d| d.last_ip.as_deref() == Some(ip)))
    }

    /// Age out threats unseen for the TTL; their non-permanent
    /// mitigations expire with them.
    pub async fn reap_stale_threats(&self) -> CoreResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.threat_ttl_s as i64);
        let removed = self.store.purge_stale_threats(cutoff)?;
        for source_ip in &removed {
            let expired = self.store.expire_rules_for_origin(source_ip)?;
            for rule_id in expired {
                info!("[HONEYPOT] Threat {} aged out, expiring {}", source_ip, rule_id);
                self.bus.publish(CoreEvent::MitigationExpired { rule_id });
            }
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture(log_path: PathBuf) -> (Arc<HoneypotIngestor>, Arc<IdentityStore>, EventBus) {
        let store = Arc::new(IdentityStore::new(Database::in_memory().expect("db")));
        let bus = EventBus::new(128);
        let scorer = Arc::new(TrustScorer::new(
            Arc::clone(&store),
            bus.clone(),
            70,
            vec![70, 50, 30],
            5,
        ));
        let ingestor = Arc::new(HoneypotIngestor::new(
            Arc::clone(&store),
            scorer,
            bus.clone(),
            Arc::new(CoreConfig::default()),
            log_path,
        ));
        (ingestor, store, bus)
    }

    #[tokio::test]
    async fn test_tail_ingests_complete_lines_only() {
        let mut file = NamedTempFile::new().expect("temp log");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"login_success","src_ip":"198.51.100.7","username":"root","password":"admin"}}"#
        )
        .expect("write");
        write!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:01Z","eventid":"port_probe","#
        )
        .expect("write partial");
        file.flush().expect("flush");

        let (ingestor, store, _bus) = fixture(file.path().to_path_buf());
        let ingested = ingestor.ingest_new_lines().await.expect("ingest");
        assert_eq!(ingested, 1, "partial trailing line must wait");

        let threat = store
            .get_threat("198.51.100.7")
            .expect("query")
            .expect("threat recorded");
        assert_eq!(threat.severity, Severity::High);

        // Complete the partial line; the next tick picks it up.
        writeln!(file, r#""src_ip":"203.0.113.9"}}"#).expect("complete line");
        file.flush().expect("flush");
        let ingested = ingestor.ingest_new_lines().await.expect("ingest");
        assert_eq!(ingested, 1);
    }

    #[tokio::test]
    async fn test_unknown_records_skipped_without_error() {
        let mut file = NamedTempFile::new().expect("temp log");
        writeln!(file, r#"{{"weird": true}}"#).expect("write");
        writeln!(file, "not json at all").expect("write");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"made_up_kind","src_ip":"1.2.3.4"}}"#
        )
        .expect("write");
        file.flush().expect("flush");

        let (ingestor, store, _bus) = fixture(file.path().to_path_buf());
        let ingested = ingestor.ingest_new_lines().await.expect("ingest");
        assert_eq!(ingested, 0);
        assert!(store.list_threats().expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_low_severity_hit_from_managed_device_stays_threat_only() {
        let mut file = NamedTempFile::new().expect("temp log");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"port_probe","src_ip":"192.168.1.50"}}"#
        )
        .expect("write");
        file.flush().expect("flush");

        let (ingestor, store, bus) = fixture(file.path().to_path_buf());
        store
            .register_pending("aa:bb:cc:00:00:05", Some("d-5"), None)
            .await
            .expect("register");
        store.approve("d-5", "test").await.expect("approve");
        store
            .set_last_seen("d-5", chrono::Utc::now(), Some("192.168.1.50"))
            .await
            .expect("seen");

        let mut rx = bus.subscribe();
        ingestor.ingest_new_lines().await.expect("ingest");

        // Threat intel recorded, but no penalty-free alert and no
        // history row: a low hit has no delta to pair with.
        let threat = store
            .get_threat("192.168.1.50")
            .expect("query")
            .expect("threat recorded");
        assert_eq!(threat.severity, Severity::Low);
        assert!(store.trust_history("d-5", 10).expect("history").is_empty());
        while let Some(event) = rx.try_recv() {
            assert!(
                !matches!(event, CoreEvent::AlertRaised(_)),
                "no alert may be raised without a matching trust delta"
            );
        }
    }

    #[tokio::test]
    async fn test_threat_updated_published_with_accumulated_severity() {
        let mut file = NamedTempFile::new().expect("temp log");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:00Z","eventid":"login_attempt","src_ip":"198.51.100.7"}}"#
        )
        .expect("write");
        writeln!(
            file,
            r#"{{"timestamp":"2026-08-01T10:00:05Z","eventid":"login_success","src_ip":"198.51.100.7"}}"#
        )
        .expect("write");
        file.flush().expect("flush");

        let (ingestor, _store, bus) = fixture(file.path().to_path_buf());
        let mut rx = bus.subscribe();
        ingestor.ingest_new_lines().await.expect("ingest");

        let mut severities = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let CoreEvent::ThreatUpdated { severity, .. } = event {
                severities.push(severity);
            }
        }
        assert_eq!(severities, vec![Severity::Low, Severity::High]);
    }
}
