//! Deception feedback loop
//!
//! Tails the honeypot event stream, distills it into per-source threat
//! intelligence, and turns confirmed threats into mitigation rules for
//! the orchestrator.

pub mod ingestor;
pub mod mitigation;
pub mod threats;

pub use ingestor::HoneypotIngestor;
pub use mitigation::MitigationGenerator;
