//! Switch control plane
//!
//! Abstracts the programmable switches that enforce decisions. The
//! orchestrator talks to [`adapter::SwitchControl`] only; the in-memory
//! implementation backs tests and single-host deployments, and the
//! queueing wrapper hides transient disconnects from callers.

pub mod adapter;
pub mod memory;
pub mod queued;

pub use adapter::{ObservationCallback, RuleAction, RuleSpec, SwitchControl};
pub use memory::InMemorySwitch;
pub use queued::QueuedSwitch;
