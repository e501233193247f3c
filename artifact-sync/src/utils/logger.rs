//! Logging configuration using tracing.

use crate::transfer::ProgressReporter;
use std::io;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level.
///
/// Log lines go to stderr, like the progress line, so stdout carries only the
/// final summary. Each log line is written above the status line instead of
/// into it.
pub fn init(level: &str, progress: Arc<ProgressReporter>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = move || ProgressLogWriter(Arc::clone(&progress));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .try_init()?;

    Ok(())
}

/// Log sink that routes every write through the progress reporter.
pub struct ProgressLogWriter(pub Arc<ProgressReporter>);

impl io::Write for ProgressLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_above(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
