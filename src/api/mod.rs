//! Management API
//!
//! Narrow HTTP surface consumed by the dashboard. Errors are typed:
//! conflicts return 409, missing entities 404, refused administrative
//! actions 403.

pub mod handlers;
pub mod models;
pub mod server;

pub use server::ApiServer;
