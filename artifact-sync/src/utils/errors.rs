//! Error types for artifact synchronization.
//!
//! Three layers, matching how far a failure is allowed to propagate:
//! - [`SyncError`]: run-level precondition failures, always fatal.
//! - [`FetchError`]: a single failed download attempt, retried by the fetcher.
//! - [`InvalidEntry`]: a manifest entry that cannot be processed at all.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Unable to resolve revision: {0}")]
    Revision(String),

    #[error("Manifest not found for revision {revision}")]
    ManifestNotFound { revision: String },

    #[error("Manifest request for revision {revision} failed with status {status}")]
    ManifestStatus { revision: String, status: StatusCode },

    #[error("Manifest request for revision {revision} failed: {source}")]
    ManifestTransport {
        revision: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Manifest for revision {revision} is malformed: {source}")]
    ManifestParse {
        revision: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest revision mismatch: requested {requested}, manifest declares {declared}")]
    RevisionMismatch { requested: String, declared: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure of one download attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("server responded with status {0}")]
    Status(StatusCode),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Reason a manifest entry was rejected without being fetched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidEntry {
    #[error("entry has an empty path")]
    BlankPath,

    #[error("entry {0} has an empty digest")]
    BlankDigest(String),

    #[error("entry path {0} escapes the destination root")]
    UnsafePath(String),

    #[error("entry {0} shares its destination with an entry of a different digest")]
    ConflictingDestination(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
