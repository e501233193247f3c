//! Sync executor - brings a destination tree in line with a manifest.
//!
//! Every manifest entry is an independent task:
//! - invalid entries (blank path/digest, unsafe path) are counted and skipped
//! - entries sharing a destination are fetched once, or rejected if their
//!   digests disagree
//! - files whose digest already matches are left alone
//! - everything else is downloaded and verified by the [`ArtifactFetcher`]
//!
//! Tasks run on a semaphore-bounded pool and always run to completion; one
//! failed file never stops the others. Each completed entry produces exactly
//! one progress update.

pub mod manifest;

use crate::config::FetchConfig;
use crate::fs::digest::digests_equal;
use crate::fs::{digest_matches, resolve_destination};
use crate::revision::RevisionSource;
use crate::transfer::fetcher::{remove_partial, ArtifactFetcher};
use crate::transfer::progress::{format_bytes, format_duration, ProgressReporter};
use crate::utils::errors::{InvalidEntry, Result};
use manifest::{FileDescriptor, Manifest, ManifestResolver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Upper bound on concurrently processed entries.
pub const MAX_CONCURRENT: usize = 32;

/// What happened to one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local file already matched its digest
    Skipped,
    /// Fetched and verified
    Downloaded { bytes: u64 },
    /// Every attempt failed
    Failed,
    /// Entry could not be processed at all
    Invalid,
    /// Needs fetching, but this is a dry run
    Pending,
}

impl SyncOutcome {
    /// Action label shown on the progress line.
    pub fn label(self) -> &'static str {
        match self {
            SyncOutcome::Skipped => "skipped",
            SyncOutcome::Downloaded { .. } => "updated",
            SyncOutcome::Failed => "failed",
            SyncOutcome::Invalid => "invalid",
            SyncOutcome::Pending => "pending",
        }
    }
}

/// Aggregate result of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub revision: String,
    pub total: usize,
    pub updated: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub failed: usize,
    pub pending: usize,
    pub downloaded_bytes: u64,
    pub elapsed: Duration,
    pub dry_run: bool,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// One-line human readable result.
    pub fn describe(&self) -> String {
        let invalid = if self.invalid > 0 {
            format!(", {} invalid", self.invalid)
        } else {
            String::new()
        };

        if !self.is_success() {
            format!(
                "Sync of {} failed: {} of {} files failed ({} updated, {} skipped{})",
                self.revision, self.failed, self.total, self.updated, self.skipped, invalid
            )
        } else if self.dry_run {
            format!(
                "Dry run for {}: {} to fetch, {} up to date{}",
                self.revision, self.pending, self.skipped, invalid
            )
        } else {
            format!(
                "Synced {}: {} updated, {} skipped{} ({} downloaded in {})",
                self.revision,
                self.updated,
                self.skipped,
                invalid,
                format_bytes(self.downloaded_bytes),
                format_duration(self.elapsed)
            )
        }
    }
}

/// Shared outcome counters, updated by every worker.
#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    updated: AtomicUsize,
    skipped: AtomicUsize,
    invalid: AtomicUsize,
    failed: AtomicUsize,
    pending: AtomicUsize,
    downloaded_bytes: AtomicU64,
}

impl Counters {
    /// Count `outcome` and return the running processed total.
    fn record(&self, outcome: SyncOutcome) -> usize {
        let counter = match outcome {
            SyncOutcome::Skipped => &self.skipped,
            SyncOutcome::Downloaded { bytes } => {
                self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
                &self.updated
            }
            SyncOutcome::Failed => &self.failed,
            SyncOutcome::Invalid => &self.invalid,
            SyncOutcome::Pending => &self.pending,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Build the HTTP client shared by manifest and blob requests.
pub fn http_client(config: &FetchConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .user_agent(concat!("artifact-sync/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Runs manifest entries through the bounded worker pool.
pub struct SyncExecutor {
    fetcher: ArtifactFetcher,
    progress: Arc<ProgressReporter>,
    max_concurrent: usize,
    dry_run: bool,
}

impl SyncExecutor {
    pub fn new(fetcher: ArtifactFetcher, progress: Arc<ProgressReporter>) -> Self {
        Self {
            fetcher,
            progress,
            max_concurrent: MAX_CONCURRENT,
            dry_run: false,
        }
    }

    /// Limit concurrency; clamped to `1..=MAX_CONCURRENT`.
    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.clamp(1, MAX_CONCURRENT);
        self
    }

    /// Check files without creating or downloading anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent
    }

    /// Synchronize every entry of `manifest` under `root`.
    pub async fn sync(&self, manifest: &Manifest, root: &Path) -> SyncSummary {
        let start_time = Instant::now();
        let total = manifest.files.len();

        info!(
            "Syncing {} files for {} into {} (concurrency: {})",
            total,
            manifest.revision,
            root.display(),
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let counters = Arc::new(Counters::default());
        let mut handles = Vec::with_capacity(total);

        for entry in plan_entries(&manifest.files, root) {
            let (descriptor, destination) = match entry {
                PlannedEntry::Ready {
                    descriptor,
                    destination,
                } => (descriptor, destination),
                PlannedEntry::Duplicate { path } => {
                    let processed = counters.record(SyncOutcome::Skipped);
                    self.progress
                        .report(processed, total, SyncOutcome::Skipped.label(), &path);
                    continue;
                }
                PlannedEntry::Rejected { path, reason } => {
                    warn!("Skipping invalid manifest entry: {}", reason);
                    let processed = counters.record(SyncOutcome::Invalid);
                    self.progress
                        .report(processed, total, SyncOutcome::Invalid.label(), &path);
                    continue;
                }
            };

            let sem = Arc::clone(&semaphore);
            let counters = Arc::clone(&counters);
            let progress = Arc::clone(&self.progress);
            let fetcher = self.fetcher.clone();
            let dry_run = self.dry_run;

            let handle = tokio::spawn(async move {
                // The semaphore is never closed, so acquisition only waits
                let _permit = sem.acquire_owned().await.ok();

                let outcome = sync_entry(&fetcher, &descriptor, &destination, dry_run).await;
                let processed = counters.record(outcome);
                progress.report(processed, total, outcome.label(), &descriptor.path);
            });
            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Sync task panicked: {}", e);
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.progress.finish();

        let summary = SyncSummary {
            revision: manifest.revision.clone(),
            total,
            updated: counters.updated.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            invalid: counters.invalid.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            pending: counters.pending.load(Ordering::Relaxed),
            downloaded_bytes: counters.downloaded_bytes.load(Ordering::Relaxed),
            elapsed: start_time.elapsed(),
            dry_run: self.dry_run,
        };

        info!(
            "Sync finished: {} updated, {} skipped, {} invalid, {} failed, {} pending, {} bytes in {}ms",
            summary.updated,
            summary.skipped,
            summary.invalid,
            summary.failed,
            summary.pending,
            summary.downloaded_bytes,
            summary.elapsed.as_millis()
        );
        summary
    }
}

/// An entry after validation and destination grouping.
enum PlannedEntry {
    Ready {
        descriptor: FileDescriptor,
        destination: PathBuf,
    },
    /// Same destination and digest as an earlier entry
    Duplicate { path: String },
    Rejected { path: String, reason: InvalidEntry },
}

/// Validate entries and give each destination a single owner.
///
/// Entries that resolve to the same file would race on it, so only the first
/// of a group is fetched. When the group disagrees on the digest there is no
/// correct content for the file, and every entry in it is rejected.
fn plan_entries(files: &[FileDescriptor], root: &Path) -> Vec<PlannedEntry> {
    let mut planned = Vec::with_capacity(files.len());
    let mut by_destination: HashMap<PathBuf, Vec<usize>> = HashMap::new();

    for descriptor in files {
        let resolved = descriptor
            .validate()
            .and_then(|()| resolve_destination(root, &descriptor.path));
        match resolved {
            Ok(destination) => {
                by_destination
                    .entry(destination.clone())
                    .or_default()
                    .push(planned.len());
                planned.push(PlannedEntry::Ready {
                    descriptor: descriptor.clone(),
                    destination,
                });
            }
            Err(reason) => planned.push(PlannedEntry::Rejected {
                path: descriptor.path.clone(),
                reason,
            }),
        }
    }

    for (destination, indices) in by_destination {
        if indices.len() < 2 {
            continue;
        }

        let digests: Vec<&str> = indices
            .iter()
            .filter_map(|&i| match &planned[i] {
                PlannedEntry::Ready { descriptor, .. } => Some(descriptor.digest.as_str()),
                _ => None,
            })
            .collect();
        let agree = digests.iter().all(|d| digests_equal(d, digests[0]));

        let (demoted, conflict) = if agree {
            (&indices[1..], false)
        } else {
            warn!(
                "{} manifest entries map to {} with different digests",
                indices.len(),
                destination.display()
            );
            (&indices[..], true)
        };

        for &i in demoted {
            let path = match &planned[i] {
                PlannedEntry::Ready { descriptor, .. } => descriptor.path.clone(),
                _ => continue,
            };
            planned[i] = if conflict {
                PlannedEntry::Rejected {
                    reason: InvalidEntry::ConflictingDestination(path.clone()),
                    path,
                }
            } else {
                debug!("Duplicate entry {} for {}", path, destination.display());
                PlannedEntry::Duplicate { path }
            };
        }
    }

    planned
}

/// Decide and carry out the action for one validated entry.
async fn sync_entry(
    fetcher: &ArtifactFetcher,
    descriptor: &FileDescriptor,
    destination: &Path,
    dry_run: bool,
) -> SyncOutcome {
    if is_up_to_date(destination, &descriptor.digest).await {
        debug!("Up to date: {}", descriptor.path);
        return SyncOutcome::Skipped;
    }

    if dry_run {
        info!("Would fetch {} ({})", descriptor.path, descriptor.digest);
        return SyncOutcome::Pending;
    }

    if let Some(parent) = destination.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!("Cannot create directory {}: {}", parent.display(), e);
            return SyncOutcome::Failed;
        }
    }

    match fetcher.fetch(descriptor, destination).await {
        Ok(bytes) => SyncOutcome::Downloaded { bytes },
        Err(e) => {
            error!(
                "Failed to fetch {} ({}) after retries: {}",
                descriptor.path, descriptor.digest, e
            );
            remove_partial(destination).await;
            SyncOutcome::Failed
        }
    }
}

async fn is_up_to_date(destination: &Path, digest: &str) -> bool {
    let path = destination.to_path_buf();
    let digest = digest.to_string();
    match tokio::task::spawn_blocking(move || digest_matches(&path, &digest)).await {
        Ok(matches) => matches,
        Err(e) => {
            warn!("Integrity check for {} aborted: {}", destination.display(), e);
            false
        }
    }
}

/// Resolve the revision, fetch its manifest, and sync it into `root`.
///
/// Any failure before per-file work begins (no revision, missing or broken
/// manifest, revision mismatch) is returned as an error and touches nothing
/// on disk. Per-file failures are reported through the summary instead.
pub async fn run(
    source: &dyn RevisionSource,
    resolver: &ManifestResolver,
    executor: &SyncExecutor,
    root: &Path,
) -> Result<SyncSummary> {
    let revision = source.resolve()?;
    let manifest = resolver.fetch_verified(&revision).await?;

    if manifest.files.is_empty() {
        info!("Manifest for {} lists no files", revision);
    }

    Ok(executor.sync(&manifest, root).await)
}
