//! Artifact Sync Library
//!
//! Content-addressed artifact synchronizer: makes a local directory tree match
//! the manifest published for a source revision, fetching only what is
//! missing or stale and verifying every download against its SHA-256 digest.

pub mod config;
pub mod executor;
pub mod fs;
pub mod revision;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use executor::{SyncExecutor, SyncSummary};
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
