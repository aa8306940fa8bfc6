//! Database query functions
//!
//! CRUD operations for devices, baselines, policies, trust history,
//! threats, mitigation rules and the decision audit.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    Baseline, DecisionAudit, Device, DeviceStatus, MitigationRule, PendingDevice, Policy,
    Severity, Threat, TrustEvent,
};

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", raw))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(&r)).transpose()
}

// ── Pending devices ─────────────────────────────────────────────────────────

pub fn insert_pending(conn: &Connection, pending: &PendingDevice) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_devices (device_id, mac, device_type, requested_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            pending.device_id,
            pending.mac,
            pending.device_type,
            ts(&pending.requested_at),
        ],
    )
    .context("Failed to insert pending device")?;
    Ok(())
}

pub fn get_pending(conn: &Connection, device_id: &str) -> Result<Option<PendingDevice>> {
    conn.query_row(
        "SELECT device_id, mac, device_type, requested_at
         FROM pending_devices WHERE device_id = ?1",
        params![device_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        },
    )
    .optional()
    .context("Failed to query pending device")?
    .map(|(device_id, mac, device_type, requested_at)| {
        Ok(PendingDevice {
            device_id,
            mac,
            device_type,
            requested_at: parse_ts(&requested_at)?,
        })
    })
    .transpose()
}

pub fn list_pending(conn: &Connection) -> Result<Vec<PendingDevice>> {
    let mut stmt = conn
        .prepare(
            "SELECT device_id, mac, device_type, requested_at
             FROM pending_devices ORDER BY requested_at",
        )
        .context("Failed to prepare pending device query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("Failed to list pending devices")?;

    let mut pending = Vec::new();
    for row in rows {
        let (device_id, mac, device_type, requested_at) = row?;
        pending.push(PendingDevice {
            device_id,
            mac,
            device_type,
            requested_at: parse_ts(&requested_at)?,
        });
    }
    Ok(pending)
}

pub fn delete_pending(conn: &Connection, device_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM pending_devices WHERE device_id = ?1",
            params![device_id],
        )
        .context("Failed to delete pending device")?;
    Ok(changed > 0)
}

pub fn pending_mac_exists(conn: &Connection, mac: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pending_devices WHERE mac = ?1",
            params![mac],
            |row| row.get(0),
        )
        .context("Failed to check pending MAC")?;
    Ok(count > 0)
}

// ── Devices ─────────────────────────────────────────────────────────────────

const DEVICE_COLUMNS: &str = "device_id, mac, device_type, fingerprint, cert_path, status, \
     first_seen, onboarded_at, profiling_started_at, last_seen, last_ip, heartbeat_expected";

fn hydrate_device(row: &Row<'_>) -> Result<Device> {
    let status_raw: String = row.get(5).context("missing status")?;
    let first_seen: String = row.get(6).context("missing first_seen")?;
    Ok(Device {
        device_id: row.get(0)?,
        mac: row.get(1)?,
        device_type: row.get(2)?,
        fingerprint: row.get(3)?,
        cert_path: row.get(4)?,
        status: status_raw
            .parse::<DeviceStatus>()
            .map_err(|e| anyhow!(e))?,
        first_seen: parse_ts(&first_seen)?,
        onboarded_at: parse_ts_opt(row.get(7).context("missing onboarded_at")?)?,
        profiling_started_at: parse_ts_opt(
            row.get(8).context("missing profiling_started_at")?,
        )?,
        last_seen: parse_ts_opt(row.get(9).context("missing last_seen")?)?,
        last_ip: row.get(10)?,
        heartbeat_expected: row.get::<_, i64>(11)? != 0,
    })
}

pub fn insert_device(conn: &Connection, device: &Device) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO devices ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            DEVICE_COLUMNS
        ),
        params![
            device.device_id,
            device.mac,
            device.device_type,
            device.fingerprint,
            device.cert_path,
            device.status.as_str(),
            ts(&device.first_seen),
            device.onboarded_at.as_ref().map(ts),
            device.profiling_started_at.as_ref().map(ts),
            device.last_seen.as_ref().map(ts),
            device.last_ip,
            device.heartbeat_expected as i64,
        ],
    )
    .context("Failed to insert device")?;
    Ok(())
}

pub fn get_device(conn: &Connection, device_id: &str) -> Result<Option<Device>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM devices WHERE device_id = ?1",
            DEVICE_COLUMNS
        ))
        .context("Failed to prepare device query")?;
    let mut rows = stmt.query(params![device_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(hydrate_device(row)?)),
        None => Ok(None),
    }
}

/// Look up the live (non-revoked) device carrying a MAC address.
pub fn get_device_by_mac(conn: &Connection, mac: &str) -> Result<Option<Device>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM devices WHERE mac = ?1 AND status != 'revoked'",
            DEVICE_COLUMNS
        ))
        .context("Failed to prepare device-by-mac query")?;
    let mut rows = stmt.query(params![mac])?;
    match rows.next()? {
        Some(row) => Ok(Some(hydrate_device(row)?)),
        None => Ok(None),
    }
}

pub fn list_devices(conn: &Connection) -> Result<Vec<Device>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM devices ORDER BY first_seen",
            DEVICE_COLUMNS
        ))
        .context("Failed to prepare device list query")?;
    let mut rows = stmt.query([])?;
    let mut devices = Vec::new();
    while let Some(row) = rows.next()? {
        devices.push(hydrate_device(row)?);
    }
    Ok(devices)
}

pub fn list_devices_with_status(
    conn: &Connection,
    status: DeviceStatus,
) -> Result<Vec<Device>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM devices WHERE status = ?1 ORDER BY first_seen",
            DEVICE_COLUMNS
        ))
        .context("Failed to prepare device status query")?;
    let mut rows = stmt.query(params![status.as_str()])?;
    let mut devices = Vec::new();
    while let Some(row) = rows.next()? {
        devices.push(hydrate_device(row)?);
    }
    Ok(devices)
}

pub fn mac_live_exists(conn: &Connection, mac: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM devices WHERE mac = ?1 AND status != 'revoked'",
            params![mac],
            |row| row.get(0),
        )
        .context("Failed to check live MAC")?;
    Ok(count > 0)
}

pub fn device_id_exists(conn: &Connection, device_id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM devices WHERE device_id = ?1)
                  + (SELECT COUNT(*) FROM pending_devices WHERE device_id = ?1)",
            params![device_id],
            |row| row.get(0),
        )
        .context("Failed to check device id")?;
    Ok(count > 0)
}

pub fn set_status(conn: &Connection, device_id: &str, status: DeviceStatus) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE devices SET status = ?2 WHERE device_id = ?1",
            params![device_id, status.as_str()],
        )
        .context("Failed to update device status")?;
    Ok(changed > 0)
}

pub fn set_last_seen(
    conn: &Connection,
    device_id: &str,
    seen_at: DateTime<Utc>,
    last_ip: Option<&str>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE devices SET last_seen = ?2, last_ip = COALESCE(?3, last_ip)
             WHERE device_id = ?1",
            params![device_id, ts(&seen_at), last_ip],
        )
        .context("Failed to update last seen")?;
    Ok(changed > 0)
}

pub fn set_cert_path(conn: &Connection, device_id: &str, cert_path: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE devices SET cert_path = ?2 WHERE device_id = ?1",
            params![device_id, cert_path],
        )
        .context("Failed to update cert path")?;
    Ok(changed > 0)
}

pub fn set_profiling_started(
    conn: &Connection,
    device_id: &str,
    started_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE devices SET profiling_started_at = ?2, onboarded_at = COALESCE(onboarded_at, ?2)
             WHERE device_id = ?1",
            params![device_id, ts(&started_at)],
        )
        .context("Failed to record profiling start")?;
    Ok(changed > 0)
}

// ── Baselines ───────────────────────────────────────────────────────────────

pub fn put_baseline(conn: &Connection, device_id: &str, baseline: &Baseline) -> Result<()> {
    let data = serde_json::to_string(baseline).context("Failed to serialize baseline")?;
    conn.execute(
        "INSERT INTO baselines (device_id, baseline_data, established_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(device_id) DO UPDATE SET
             baseline_data = excluded.baseline_data,
             updated_at = excluded.updated_at",
        params![
            device_id,
            data,
            ts(&baseline.established_at),
            ts(&baseline.updated_at),
        ],
    )
    .context("Failed to store baseline")?;
    Ok(())
}

pub fn get_baseline(conn: &Connection, device_id: &str) -> Result<Option<Baseline>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT baseline_data FROM baselines WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query baseline")?;
    data.map(|d| serde_json::from_str(&d).context("Failed to parse stored baseline"))
        .transpose()
}

pub fn delete_baseline(conn: &Connection, device_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM baselines WHERE device_id = ?1",
            params![device_id],
        )
        .context("Failed to delete baseline")?;
    Ok(changed > 0)
}

// ── Policies ────────────────────────────────────────────────────────────────

pub fn put_policy(conn: &Connection, policy: &Policy) -> Result<()> {
    let data = serde_json::to_string(policy).context("Failed to serialize policy")?;
    conn.execute(
        "INSERT INTO policies (device_id, policy_data, generated_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(device_id) DO UPDATE SET
             policy_data = excluded.policy_data,
             updated_at = excluded.updated_at",
        params![
            policy.device_id,
            data,
            ts(&policy.generated_at),
            ts(&policy.updated_at),
        ],
    )
    .context("Failed to store policy")?;
    Ok(())
}

pub fn get_policy(conn: &Connection, device_id: &str) -> Result<Option<Policy>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT policy_data FROM policies WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query policy")?;
    data.map(|d| serde_json::from_str(&d).context("Failed to parse stored policy"))
        .transpose()
}

pub fn delete_policy(conn: &Connection, device_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM policies WHERE device_id = ?1",
            params![device_id],
        )
        .context("Failed to delete policy")?;
    Ok(changed > 0)
}

// ── Trust history ───────────────────────────────────────────────────────────

pub fn append_trust_event(conn: &Connection, event: &TrustEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO trust_score_history (device_id, score_after, delta, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.device_id,
            event.score_after,
            event.delta,
            event.reason,
            ts(&event.created_at),
        ],
    )
    .context("Failed to append trust event")?;
    Ok(())
}

/// Latest recorded score, or `None` when the device has no history yet.
pub fn latest_trust(conn: &Connection, device_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT score_after FROM trust_score_history
         WHERE device_id = ?1 ORDER BY id DESC LIMIT 1",
        params![device_id],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to query latest trust")
}

pub fn trust_history(
    conn: &Connection,
    device_id: &str,
    limit: usize,
) -> Result<Vec<TrustEvent>> {
    let mut stmt = conn
        .prepare(
            "SELECT device_id, score_after, delta, reason, created_at
             FROM trust_score_history
             WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .context("Failed to prepare trust history query")?;
    let rows = stmt
        .query_map(params![device_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("Failed to list trust history")?;

    let mut events = Vec::new();
    for row in rows {
        let (device_id, score_after, delta, reason, created_at) = row?;
        events.push(TrustEvent {
            device_id,
            score_after,
            delta,
            reason,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(events)
}

// ── Decision audit ──────────────────────────────────────────────────────────

pub fn insert_audit(conn: &Connection, audit: &DecisionAudit) -> Result<()> {
    conn.execute(
        "INSERT INTO device_history
             (created_at, device_id, trust, threat_level, decision, reason,
              prev_decision, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ts(&audit.created_at),
            audit.device_id,
            audit.trust,
            audit.threat_level.map(|s| s.as_str()),
            audit.decision.as_str(),
            audit.reason,
            audit.prev_decision.map(|d| d.as_str()),
            audit.correlation_id,
        ],
    )
    .context("Failed to insert audit record")?;
    Ok(())
}

pub fn list_audit_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<DecisionAudit>> {
    let mut stmt = conn
        .prepare(
            "SELECT created_at, device_id, trust, threat_level, decision, reason,
                    prev_decision, correlation_id
             FROM device_history WHERE created_at >= ?1 ORDER BY id",
        )
        .context("Failed to prepare audit query")?;
    let rows = stmt
        .query_map(params![ts(&since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })
        .context("Failed to list audit records")?;

    let mut records = Vec::new();
    for row in rows {
        let (created_at, device_id, trust, threat_level, decision, reason, prev, corr) = row?;
        records.push(DecisionAudit {
            created_at: parse_ts(&created_at)?,
            device_id,
            trust,
            threat_level: threat_level
                .map(|s| s.parse::<Severity>().map_err(|e| anyhow!(e)))
                .transpose()?,
            decision: decision.parse().map_err(|e: String| anyhow!(e))?,
            reason,
            prev_decision: prev
                .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
                .transpose()?,
            correlation_id: corr,
        });
    }
    Ok(records)
}

// ── Threats ─────────────────────────────────────────────────────────────────

pub fn upsert_threat(conn: &Connection, threat: &Threat) -> Result<()> {
    let kinds = serde_json::to_string(&threat.event_kinds)
        .context("Failed to serialize threat event kinds")?;
    conn.execute(
        "INSERT INTO threats (source_ip, first_seen, last_seen, event_kinds, severity)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(source_ip) DO UPDATE SET
             last_seen = excluded.last_seen,
             event_kinds = excluded.event_kinds,
             severity = excluded.severity",
        params![
            threat.source_ip,
            ts(&threat.first_seen),
            ts(&threat.last_seen),
            kinds,
            threat.severity.as_str(),
        ],
    )
    .context("Failed to upsert threat")?;
    Ok(())
}

pub fn get_threat(conn: &Connection, source_ip: &str) -> Result<Option<Threat>> {
    let mut stmt = conn
        .prepare(
            "SELECT source_ip, first_seen, last_seen, event_kinds, severity
             FROM threats WHERE source_ip = ?1",
        )
        .context("Failed to prepare threat query")?;
    let mut rows = stmt.query(params![source_ip])?;
    match rows.next()? {
        Some(row) => Ok(Some(threat_from_row(row)?)),
        None => Ok(None),
    }
}

fn threat_from_row(row: &Row<'_>) -> Result<Threat> {
    let first_seen: String = row.get(1)?;
    let last_seen: String = row.get(2)?;
    let kinds: String = row.get(3)?;
    let severity: String = row.get(4)?;
    Ok(Threat {
        source_ip: row.get(0)?,
        first_seen: parse_ts(&first_seen)?,
        last_seen: parse_ts(&last_seen)?,
        event_kinds: serde_json::from_str(&kinds)
            .context("Failed to parse threat event kinds")?,
        severity: severity.parse::<Severity>().map_err(|e| anyhow!(e))?,
    })
}

pub fn list_threats(conn: &Connection) -> Result<Vec<Threat>> {
    let mut stmt = conn
        .prepare(
            "SELECT source_ip, first_seen, last_seen, event_kinds, severity
             FROM threats ORDER BY last_seen DESC",
        )
        .context("Failed to prepare threat list query")?;
    let mut rows = stmt.query([])?;
    let mut threats = Vec::new();
    while let Some(row) = rows.next()? {
        threats.push(threat_from_row(row)?);
    }
    Ok(threats)
}

/// Delete threats not seen since the cutoff; returns the removed IPs so
/// their non-permanent mitigations can expire with them.
pub fn purge_stale_threats(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT source_ip FROM threats WHERE last_seen < ?1")
        .context("Failed to prepare stale threat query")?;
    let stale: Vec<String> = stmt
        .query_map(params![ts(&cutoff)], |row| row.get(0))
        .context("Failed to list stale threats")?
        .collect::<rusqlite::Result<_>>()?;

    conn.execute(
        "DELETE FROM threats WHERE last_seen < ?1",
        params![ts(&cutoff)],
    )
    .context("Failed to purge stale threats")?;
    Ok(stale)
}

// ── Mitigation rules ────────────────────────────────────────────────────────

pub fn upsert_mitigation(conn: &Connection, rule: &MitigationRule) -> Result<()> {
    let match_data =
        serde_json::to_string(&rule.matches).context("Failed to serialize rule match")?;
    conn.execute(
        "INSERT INTO mitigation_rules
             (rule_id, match_data, action, priority, reason, origin_threat, permanent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(rule_id) DO UPDATE SET
             action = excluded.action,
             priority = excluded.priority,
             reason = excluded.reason,
             permanent = excluded.permanent",
        params![
            rule.rule_id,
            match_data,
            rule.action.as_str(),
            rule.priority as i64,
            rule.reason,
            rule.origin_threat,
            rule.permanent as i64,
            ts(&rule.created_at),
        ],
    )
    .context("Failed to upsert mitigation rule")?;
    Ok(())
}

pub fn list_mitigations(conn: &Connection) -> Result<Vec<MitigationRule>> {
    let mut stmt = conn
        .prepare(
            "SELECT rule_id, match_data, action, priority, reason, origin_threat,
                    permanent, created_at
             FROM mitigation_rules ORDER BY created_at",
        )
        .context("Failed to prepare mitigation list query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })
        .context("Failed to list mitigation rules")?;

    let mut rules = Vec::new();
    for row in rows {
        let (rule_id, match_data, action, priority, reason, origin, permanent, created_at) =
            row?;
        rules.push(MitigationRule {
            rule_id,
            matches: serde_json::from_str(&match_data)
                .context("Failed to parse stored rule match")?,
            action: action.parse().map_err(|e: String| anyhow!(e))?,
            priority: priority as u16,
            reason,
            origin_threat: origin,
            permanent: permanent != 0,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(rules)
}

pub fn delete_mitigation(conn: &Connection, rule_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM mitigation_rules WHERE rule_id = ?1",
            params![rule_id],
        )
        .context("Failed to delete mitigation rule")?;
    Ok(changed > 0)
}

/// Remove non-permanent rules derived from an expired threat; returns
/// the removed rule ids for uninstallation.
pub fn expire_rules_for_origin(conn: &Connection, origin: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT rule_id FROM mitigation_rules
             WHERE origin_threat = ?1 AND permanent = 0",
        )
        .context("Failed to prepare rule expiry query")?;
    let expired: Vec<String> = stmt
        .query_map(params![origin], |row| row.get(0))
        .context("Failed to list expiring rules")?
        .collect::<rusqlite::Result<_>>()?;

    conn.execute(
        "DELETE FROM mitigation_rules WHERE origin_threat = ?1 AND permanent = 0",
        params![origin],
    )
    .context("Failed to expire mitigation rules")?;
    Ok(expired)
}
