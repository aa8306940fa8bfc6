//! Database schema definitions
//!
//! Creates and migrates the SQLite tables. Migrations are forward-only
//! and idempotent: every startup replays `create_tables` safely.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all database tables
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Devices table: one row per device, kept for audit after revocation
        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            mac TEXT NOT NULL,
            device_type TEXT,
            fingerprint TEXT NOT NULL,
            cert_path TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            first_seen TEXT NOT NULL,
            onboarded_at TEXT,
            profiling_started_at TEXT,
            last_seen TEXT,
            last_ip TEXT,
            heartbeat_expected INTEGER NOT NULL DEFAULT 0
        );

        -- MAC uniqueness holds across the live population only; revoked
        -- devices keep their rows.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_live_mac
            ON devices(mac) WHERE status != 'revoked';

        -- Devices awaiting administrator approval
        CREATE TABLE IF NOT EXISTS pending_devices (
            device_id TEXT PRIMARY KEY,
            mac TEXT UNIQUE NOT NULL,
            device_type TEXT,
            requested_at TEXT NOT NULL
        );

        -- Decision audit: every orchestrator decision, with correlation ids
        CREATE TABLE IF NOT EXISTS device_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            device_id TEXT NOT NULL,
            trust INTEGER NOT NULL,
            threat_level TEXT,
            decision TEXT NOT NULL,
            reason TEXT NOT NULL,
            prev_decision TEXT,
            correlation_id TEXT NOT NULL
        );

        -- Append-only trust score history
        CREATE TABLE IF NOT EXISTS trust_score_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            score_after INTEGER NOT NULL,
            delta INTEGER NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- Behavioral baselines, one JSON document per device
        CREATE TABLE IF NOT EXISTS baselines (
            device_id TEXT PRIMARY KEY,
            baseline_data TEXT NOT NULL,
            established_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Device policies, one JSON document per device
        CREATE TABLE IF NOT EXISTS policies (
            device_id TEXT PRIMARY KEY,
            policy_data TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Threat intelligence keyed by attacker source IP
        CREATE TABLE IF NOT EXISTS threats (
            source_ip TEXT PRIMARY KEY,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            event_kinds TEXT NOT NULL,
            severity TEXT NOT NULL
        );

        -- Mitigation rules; permanent rows survive restarts
        CREATE TABLE IF NOT EXISTS mitigation_rules (
            rule_id TEXT PRIMARY KEY,
            match_data TEXT NOT NULL,
            action TEXT NOT NULL,
            priority INTEGER NOT NULL,
            reason TEXT NOT NULL,
            origin_threat TEXT NOT NULL,
            permanent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        -- Indexes for hot paths
        CREATE INDEX IF NOT EXISTS idx_devices_mac ON devices(mac);
        CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
        CREATE INDEX IF NOT EXISTS idx_history_device ON device_history(device_id);
        CREATE INDEX IF NOT EXISTS idx_history_created ON device_history(created_at);
        CREATE INDEX IF NOT EXISTS idx_trust_device ON trust_score_history(device_id);
        CREATE INDEX IF NOT EXISTS idx_threats_last_seen ON threats(last_seen);
        CREATE INDEX IF NOT EXISTS idx_mitigation_origin ON mitigation_rules(origin_threat);
        "#,
    )
    .context("Failed to create database tables")?;

    // Backward-compatible migration for databases created before
    // heartbeat_expected existed.
    let has_heartbeat: bool = conn
        .prepare("PRAGMA table_info(devices)")
        .and_then(|mut stmt| {
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                if name == "heartbeat_expected" {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .context("Failed to inspect devices table")?;

    if !has_heartbeat {
        conn.execute_batch(
            "ALTER TABLE devices ADD COLUMN heartbeat_expected INTEGER NOT NULL DEFAULT 0",
        )
        .context("Failed to add heartbeat_expected column")?;
    }

    Ok(())
}
