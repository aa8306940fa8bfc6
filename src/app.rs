//! Application assembly
//!
//! Builds every component against one configuration, wires the event
//! bus, and runs the background tasks. The core is embeddable: `App` is
//! a plain library type driven by a thin main.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::analyst::{AnomalyDetector, FlowPoller};
use crate::api::handlers::AppState;
use crate::api::ApiServer;
use crate::bus::EventBus;
use crate::cli::{parse_cli_args, usage_text, version_text, CliCommand};
use crate::config::CoreConfig;
use crate::database::Database;
use crate::honeypot::{HoneypotIngestor, MitigationGenerator};
use crate::identity::{AttestationLoop, CertificateAuthority, IdentityStore, OnboardingCoordinator};
use crate::orchestrator::TrafficOrchestrator;
use crate::switch::{InMemorySwitch, QueuedSwitch, SwitchControl};
use crate::trust::TrustScorer;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
const POSITIVE_TICK_INTERVAL: Duration = Duration::from_secs(3600);

/// Fully wired policy core.
pub struct App {
    pub config: Arc<CoreConfig>,
    pub bus: EventBus,
    pub store: Arc<IdentityStore>,
    pub ca: Arc<CertificateAuthority>,
    pub scorer: Arc<TrustScorer>,
    pub coordinator: Arc<OnboardingCoordinator>,
    pub attestation: Arc<AttestationLoop>,
    pub poller: Arc<FlowPoller>,
    pub detector: Arc<AnomalyDetector>,
    pub ingestor: Arc<HoneypotIngestor>,
    pub generator: Arc<MitigationGenerator>,
    pub orchestrator: Arc<TrafficOrchestrator>,
    pub switch: Arc<dyn SwitchControl>,
}

impl App {
    /// Build against the configured database path and switch adapter.
    pub fn build(config: CoreConfig, switch: Arc<dyn SwitchControl>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let db = Database::new(config.db_path().to_path_buf())?;
        Self::build_with_database(config, db, switch)
    }

    /// Build with an explicit database handle (tests use in-memory).
    pub fn build_with_database(
        config: CoreConfig,
        db: Database,
        switch: Arc<dyn SwitchControl>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let bus = EventBus::new(config.event_queue_size);

        let store = Arc::new(IdentityStore::new(db));
        let ca = Arc::new(
            CertificateAuthority::init_or_load_root(config.ca_dir())
                .context("Failed to initialize certificate authority")?,
        );
        let scorer = Arc::new(TrustScorer::new(
            Arc::clone(&store),
            bus.clone(),
            config.initial_trust_score,
            config.trust_thresholds.clone(),
            config.trust_hysteresis,
        ));
        let coordinator = Arc::new(OnboardingCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&ca),
            Arc::clone(&scorer),
            Arc::clone(&switch),
            bus.clone(),
            Arc::clone(&config),
        ));
        let attestation = Arc::new(AttestationLoop::new(
            Arc::clone(&store),
            Arc::clone(&ca),
            Arc::clone(&scorer),
            bus.clone(),
            Arc::clone(&config),
        ));
        let poller = Arc::new(FlowPoller::new(
            Arc::clone(&store),
            Arc::clone(&switch),
            bus.clone(),
            Arc::clone(&config),
        ));
        let detector = Arc::new(AnomalyDetector::new(
            Arc::clone(&store),
            Arc::clone(&scorer),
            bus.clone(),
            Arc::clone(&config),
        ));
        let log_path = config
            .honeypot_log_path
            .clone()
            .context("honeypot_log_path is required")?;
        let ingestor = Arc::new(HoneypotIngestor::new(
            Arc::clone(&store),
            Arc::clone(&scorer),
            bus.clone(),
            Arc::clone(&config),
            log_path,
        ));
        let generator = Arc::new(MitigationGenerator::new(bus.clone()));
        let orchestrator = Arc::new(TrafficOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&scorer),
            Arc::clone(&switch),
            bus.clone(),
            Arc::clone(&config),
        ));

        Ok(Self {
            config,
            bus,
            store,
            ca,
            scorer,
            coordinator,
            attestation,
            poller,
            detector,
            ingestor,
            generator,
            orchestrator,
            switch,
        })
    }

    /// Restore persisted state and spawn every background task.
    pub async fn start(&self) -> Result<()> {
        self.coordinator.attach_observer();
        self.orchestrator
            .restore()
            .await
            .context("Failed to restore orchestrator state")?;

        self.orchestrator.spawn();
        self.detector.spawn();
        self.generator.spawn();
        self.poller.spawn();
        self.attestation.spawn();
        self.ingestor.spawn();
        self.coordinator.spawn_finalization_watcher();

        // Reconcile loop: retries fail-closed devices once the data
        // plane recovers.
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONCILE_INTERVAL).await;
                match orchestrator.reconcile().await {
                    Ok(0) => {}
                    Ok(n) => info!("[APP] Reconciled {} fail-closed devices", n),
                    Err(err) => warn!("[APP] Reconcile failed: {}", err),
                }
            }
        });

        if self.config.positive_tick_enabled {
            let scorer = Arc::clone(&self.scorer);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(POSITIVE_TICK_INTERVAL).await;
                    match scorer.apply_positive_tick().await {
                        Ok(n) if n > 0 => info!("[APP] Positive tick applied to {} devices", n),
                        Ok(_) => {}
                        Err(err) => warn!("[APP] Positive tick failed: {}", err),
                    }
                }
            });
        }

        info!("[APP] Policy core started");
        Ok(())
    }

    /// Signal every task to stop. Tasks drain within their sleep
    /// granularity; callers that need a hard deadline race this against
    /// a timer.
    pub fn shutdown(&self) {
        self.orchestrator.stop();
        self.detector.stop();
        self.generator.stop();
        self.poller.stop();
        self.attestation.stop();
        self.ingestor.stop();
        self.coordinator.stop_watcher();
        info!("[APP] Shutdown signaled");
    }

    fn api_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            store: Arc::clone(&self.store),
            scorer: Arc::clone(&self.scorer),
            ca: Arc::clone(&self.ca),
            coordinator: Arc::clone(&self.coordinator),
            orchestrator: Arc::clone(&self.orchestrator),
            ingestor: Arc::clone(&self.ingestor),
            bus: self.bus.clone(),
            config: Arc::clone(&self.config),
        })
    }

    /// Run the management API until ctrl-c.
    pub async fn serve(&self) -> Result<()> {
        let address: SocketAddr = self
            .config
            .api_listen
            .parse()
            .with_context(|| format!("Invalid api_listen address {}", self.config.api_listen))?;
        let server = ApiServer::new(address, self.api_state());

        tokio::select! {
            result = server.run() => {
                result.context("API server exited")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[APP] Interrupt received");
            }
        }

        self.shutdown();
        // Drain deadline for background tasks.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

/// Run the CLI by parsing args and dispatching the command.
pub async fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    match parse_cli_args(args)? {
        CliCommand::Help => {
            println!("{}", usage_text());
            Ok(())
        }
        CliCommand::Version => {
            println!("{}", version_text());
            Ok(())
        }
        CliCommand::Run { config } => {
            let config = load_config(config)?;
            let switch: Arc<dyn SwitchControl> = Arc::new(QueuedSwitch::new(Arc::new(
                InMemorySwitch::new(),
            )));
            let app = App::build(config, switch)?;
            app.start().await?;
            app.serve().await
        }
        CliCommand::InitDb { config } => {
            let config = load_config(config)?;
            let db = Database::new(config.db_path().to_path_buf())?;
            CertificateAuthority::init_or_load_root(config.ca_dir())?;
            println!("Initialized database at {}", db.path().display());
            Ok(())
        }
        CliCommand::Status { config } => {
            let config = load_config(config)?;
            let db = Database::new(config.db_path().to_path_buf())?;
            print_status(&db)
        }
    }
}

fn load_config(path: Option<std::path::PathBuf>) -> Result<CoreConfig> {
    let config = match path {
        Some(path) => CoreConfig::load(&path)?,
        None => {
            let config = CoreConfig::from_env()?;
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn print_status(db: &Database) -> Result<()> {
    let (devices, pending, threats, mitigations) = db.with(|conn| {
        Ok((
            crate::database::queries::list_devices(conn)?,
            crate::database::queries::list_pending(conn)?,
            crate::database::queries::list_threats(conn)?,
            crate::database::queries::list_mitigations(conn)?,
        ))
    })?;

    println!("devices:          {}", devices.len());
    for device in &devices {
        println!(
            "  {} {} {} last_seen={}",
            device.device_id,
            device.mac,
            device.status,
            device
                .last_seen
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
    }
    println!("pending:          {}", pending.len());
    println!("threats:          {}", threats.len());
    println!("mitigation rules: {}", mitigations.len());
    if let Err(err) = std::io::Write::flush(&mut std::io::stdout()) {
        error!("Failed to flush status output: {}", err);
    }
    Ok(())
}
