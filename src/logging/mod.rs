//! Structured logging for the policy core
//!
//! Two sinks: a compact console stream for operators, and a
//! daily-rotating JSON file that doubles as the flight recorder behind
//! the decision audit — every `[ORCH]`/`[TRUST]`/`[ATTEST]` line lands
//! there with file and line attribution. File writes go through a
//! non-blocking worker so a slow disk never stalls a decision path.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Unless `RUST_LOG` says otherwise, keep the core chatty and the HTTP
/// stack quiet; management-API request noise drowns the audit trail.
const DEFAULT_FILTER: &str = "info,hyper=warn,tower_http=warn";

/// Keeps the log worker alive. Dropping it flushes and stops file
/// logging, so the caller holds it for the life of the process.
pub struct LogHandle {
    pub log_dir: PathBuf,
    _guard: WorkerGuard,
}

/// Initialize logging into the default (or `TRUSTPLANE_LOG_DIR`) location.
pub fn init_logging() -> Result<LogHandle, Box<dyn std::error::Error>> {
    init_logging_to(resolve_log_dir()?)
}

/// Initialize logging into an explicit directory. Tolerates an already
/// installed global subscriber so embedding hosts and tests can call it
/// freely.
pub fn init_logging_to(log_dir: PathBuf) -> Result<LogHandle, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, "trustplane.json");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console_layer = fmt::layer().with_target(false).compact();
    let audit_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .json();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let init_result = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(audit_layer)
        .try_init();

    match init_result {
        Ok(()) => {
            tracing::info!("Audit log directory: {}", log_dir.display());
        }
        Err(e) if e.to_string().contains("already been set") => {}
        Err(e) => return Err(Box::new(e)),
    }

    Ok(LogHandle {
        log_dir,
        _guard: guard,
    })
}

/// `TRUSTPLANE_LOG_DIR` wins, matching the configuration layer's
/// environment-override convention; otherwise logs live next to the
/// identity database under the platform data directory.
fn resolve_log_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(dir) = std::env::var("TRUSTPLANE_LOG_DIR") {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let base = dirs::data_dir().ok_or("Could not find platform data directory")?;
    Ok(base.join("trustplane").join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_directory_and_survives_reinit() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let log_dir = dir.path().join("logs");

        let handle = init_logging_to(log_dir.clone()).expect("first init");
        assert!(handle.log_dir.exists());

        // A second subscriber cannot be installed globally; the call
        // still succeeds and still hands back a live file worker.
        let again = init_logging_to(log_dir).expect("re-init tolerated");
        assert!(again.log_dir.exists());
    }
}
