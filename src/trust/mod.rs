//! Trust evaluation subsystem

pub mod scorer;

pub use scorer::TrustScorer;
