//! Test helpers for sluice integration tests.
//!
//! All helpers run against a live database named by `DATABASE_URL`; the
//! tests that use them are `#[ignore]`d by default.

pub mod helpers;

pub use helpers::*;

/// Result type for test helpers.
pub type Result<T> = std::result::Result<T, anyhow::Error>;
