//! Artifact Sync - Main entry point
//!
//! Resolves the source revision, fetches its manifest and brings the
//! destination tree in line with it.

use anyhow::Result;
use artifact_sync::{
    config::Config,
    executor::{self, manifest::ManifestResolver, SyncExecutor},
    revision::{FixedRevision, GitRevisionSource, RevisionSource},
    transfer::{ArtifactFetcher, ProgressReporter, RetryPolicy},
    utils,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Revision to sync (skips the git lookup)
    #[arg(short, long)]
    revision: Option<String>,

    /// Destination root (overrides config)
    #[arg(short, long, value_name = "DIR")]
    destination: Option<PathBuf>,

    /// Artifact server base URL (overrides config)
    #[arg(short, long, value_name = "URL")]
    base_url: Option<String>,

    /// Maximum concurrent downloads (overrides config)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Report what would be fetched without downloading
    #[arg(long)]
    dry_run: bool,

    /// Disable the progress line
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.base_url {
        config.server.base_url = url;
    }
    if let Some(destination) = args.destination {
        config.sync.destination = destination;
    }
    if let Some(concurrency) = args.concurrency {
        config.sync.max_concurrent = concurrency;
    }
    let config = config.normalized()?;

    let progress = Arc::new(if config.progress.enabled && !args.no_progress {
        ProgressReporter::stderr(config.progress.fallback_width)
    } else {
        ProgressReporter::hidden()
    });

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, Arc::clone(&progress))?;

    tracing::info!(
        "Starting artifact-sync v{} (server: {}, destination: {})",
        env!("CARGO_PKG_VERSION"),
        config.server.base_url,
        config.sync.destination.display()
    );

    let source: Box<dyn RevisionSource> = match args.revision {
        Some(revision) => Box::new(FixedRevision(revision)),
        None => Box::new(GitRevisionSource::from_config(&config.revision)),
    };

    let client = executor::http_client(&config.fetch)?;
    let resolver = ManifestResolver::new(client.clone(), config.server.base_url.clone());
    let fetcher = ArtifactFetcher::new(
        client,
        config.server.base_url.clone(),
        RetryPolicy::from(&config.fetch),
    );

    let executor = SyncExecutor::new(fetcher, progress)
        .with_concurrency(config.sync.max_concurrent)
        .with_dry_run(args.dry_run);

    match executor::run(source.as_ref(), &resolver, &executor, &config.sync.destination).await {
        Ok(summary) => {
            println!("{}", summary.describe());
            if summary.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
