//! Identity and onboarding subsystem
//!
//! Owns device records, certificates, baselines, policies and trust
//! history. Every other component reads and mutates identity state
//! through [`store::IdentityStore`].

pub mod attestation;
pub mod ca;
pub mod onboarding;
pub mod store;

pub use attestation::AttestationLoop;
pub use ca::{CertificateAuthority, ValidationOutcome};
pub use onboarding::OnboardingCoordinator;
pub use store::IdentityStore;
