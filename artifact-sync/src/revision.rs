//! Source revision lookup.
//!
//! The revision selects which manifest to synchronize. Normally it is the tip
//! of a git ref in a local checkout; it can also be pinned on the command line.

use crate::config::RevisionConfig;
use crate::utils::errors::{Result, SyncError};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// Something that can name the revision to sync.
pub trait RevisionSource {
    fn resolve(&self) -> Result<String>;
}

/// Resolves the tip of a git ref with `git rev-parse`.
#[derive(Debug, Clone)]
pub struct GitRevisionSource {
    repo_dir: PathBuf,
    git_ref: String,
}

impl GitRevisionSource {
    pub fn new(repo_dir: impl Into<PathBuf>, git_ref: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            git_ref: git_ref.into(),
        }
    }

    pub fn from_config(config: &RevisionConfig) -> Self {
        Self::new(config.repo_dir.clone(), config.git_ref.clone())
    }
}

impl RevisionSource for GitRevisionSource {
    fn resolve(&self) -> Result<String> {
        let rev_spec = format!("{}^{{commit}}", self.git_ref);
        debug!("Running git rev-parse --verify {} in {}", rev_spec, self.repo_dir.display());

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(["rev-parse", "--verify", "--quiet", rev_spec.as_str()])
            .output()
            .map_err(|e| SyncError::Revision(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(SyncError::Revision(format!(
                "git rev-parse {} exited with {}: {}",
                self.git_ref,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let revision = parse_revision(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            SyncError::Revision(format!("git returned no revision for {}", self.git_ref))
        })?;
        info!("Resolved {} to {}", self.git_ref, revision);
        Ok(revision)
    }
}

/// A revision given explicitly, e.g. via `--revision`.
#[derive(Debug, Clone)]
pub struct FixedRevision(pub String);

impl RevisionSource for FixedRevision {
    /// The given text must be a single token; surrounding whitespace is ignored.
    fn resolve(&self) -> Result<String> {
        let revision = self.0.trim();
        if revision.is_empty() {
            return Err(SyncError::Revision("empty revision given".to_string()));
        }
        if revision.contains(char::is_whitespace) {
            return Err(SyncError::Revision(format!(
                "revision {:?} contains whitespace",
                revision
            )));
        }
        Ok(revision.to_string())
    }
}

/// First whitespace-delimited token of command output, if any.
fn parse_revision(output: &str) -> Option<String> {
    output.split_whitespace().next().map(str::to_string)
}
