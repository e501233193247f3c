//! Utility modules for artifact-sync.

pub mod errors;
pub mod logger;

pub use errors::{FetchError, InvalidEntry, Result, SyncError};
