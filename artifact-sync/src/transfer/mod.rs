//! Artifact transfer: per-file download and progress display.

pub mod fetcher;
pub mod progress;

pub use fetcher::{ArtifactFetcher, RetryPolicy};
pub use progress::{ProgressReporter, ProgressState};
