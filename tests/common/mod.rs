//! Shared fixture for integration scenarios
//!
//! Builds a fully wired core against an in-memory database and the
//! in-process switch. Tests drive components directly instead of
//! spawning the background tasks, so every step is deterministic.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use trustplane::{
    App, CoreConfig, Database, DeviceStatus, InMemorySwitch, SwitchControl,
};

pub struct TestCore {
    pub app: App,
    pub switch: Arc<InMemorySwitch>,
    /// Holds the CA directory and honeypot log alive for the test.
    pub dir: TempDir,
    pub log_path: PathBuf,
}

pub fn test_config(dir: &TempDir) -> CoreConfig {
    let log_path = dir.path().join("honeypot.ndjson");
    CoreConfig {
        db_path: Some(PathBuf::from(":memory:")),
        ca_dir: Some(dir.path().join("ca")),
        honeypot_log_path: Some(log_path),
        honeypot_port: Some(3),
        quarantine_port: Some(4),
        ..CoreConfig::default()
    }
}

pub fn build_core() -> TestCore {
    build_core_with(Database::in_memory().expect("in-memory database"))
}

pub fn build_core_with(db: Database) -> TestCore {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(&dir);
    let log_path = config.honeypot_log_path.clone().expect("log path");

    let switch = Arc::new(InMemorySwitch::new());
    let app = App::build_with_database(
        config,
        db,
        Arc::clone(&switch) as Arc<dyn SwitchControl>,
    )
    .expect("app builds");
    app.coordinator.attach_observer();

    TestCore {
        app,
        switch,
        dir,
        log_path,
    }
}

/// Register, approve, emit profiling traffic, and finalize a device so
/// it lands in `active` with a baseline and least-privilege policy.
pub async fn onboard_active_device(core: &TestCore, device_id: &str, mac: &str) {
    core.app
        .store
        .register_pending(mac, Some(device_id), Some("sensor"))
        .await
        .expect("register");
    core.app
        .coordinator
        .approve(device_id, "integration test")
        .await
        .expect("approve");

    for _ in 0..100 {
        core.switch
            .inject_packet(mac, 120, "tcp", Some("10.0.0.10"), Some(443));
    }

    // Backdate the window start so baseline rates reflect a full window.
    core.app
        .store
        .set_profiling_started(device_id, Utc::now() - chrono::Duration::seconds(300))
        .await
        .expect("backdate profiling");

    core.app
        .coordinator
        .finalize(device_id)
        .await
        .expect("finalize");

    let device = core.app.store.get_device(device_id).await.expect("device");
    assert_eq!(device.status, DeviceStatus::Active);

    core.app
        .store
        .set_last_seen(device_id, Utc::now(), Some("192.168.1.50"))
        .await
        .expect("seen");
}
