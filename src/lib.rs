//! Zero Trust Policy Core
//!
//! The always-on control plane for a small-office IoT network:
//! - Identity and onboarding: certificate issuance, physical-identity
//!   binding, and a time-bounded profiling window yielding a
//!   least-privilege policy
//! - Trust scoring: a persistent, event-driven score per device with
//!   change notifications
//! - Heuristic analyst: flow polling, baseline comparison, anomaly alerts
//! - Deception feedback: honeypot log ingestion and automatic mitigation
//! - Traffic orchestration: one decision per device, enforced through a
//!   switch-control adapter

pub mod analyst;
pub mod api;
pub mod app;
pub mod bus;
mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod honeypot;
pub mod identity;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod switch;
pub mod trust;

pub use analyst::{AnomalyDetector, FlowPoller};
pub use app::App;
pub use bus::{CoreEvent, EventBus};
pub use config::CoreConfig;
pub use database::Database;
pub use error::{AttestationReason, CoreError, CoreResult};
pub use honeypot::{HoneypotIngestor, MitigationGenerator};
pub use identity::{AttestationLoop, CertificateAuthority, IdentityStore, OnboardingCoordinator};
pub use models::*;
pub use orchestrator::TrafficOrchestrator;
pub use switch::{InMemorySwitch, QueuedSwitch, RuleAction, RuleSpec, SwitchControl};
pub use trust::TrustScorer;
