//! Durable state for the policy core
//!
//! Single-file SQLite store owning device, certificate, baseline, policy,
//! trust, threat and mitigation rows. All other components read and write
//! through the identity store's interface, never this module directly.

pub mod connection;
pub mod queries;
pub mod schema;

pub use connection::Database;
