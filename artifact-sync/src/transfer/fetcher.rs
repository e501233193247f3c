//! Single-file download from content-addressed storage.
//!
//! Blobs live at `{base_url}/artifacts/{digest}`. Each attempt streams the
//! body into a truncated destination file, then checks the written length
//! (when the manifest declares one) and the SHA-256 digest. A failed attempt
//! never leaves its file behind.

use crate::config::FetchConfig;
use crate::executor::manifest::FileDescriptor;
use crate::fs::digest::{digests_equal, file_digest};
use crate::utils::errors::FetchError;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Attempt cap and linear backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }
}

impl RetryPolicy {
    /// Sleep applied after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Downloads and verifies individual artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ArtifactFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            retry,
        }
    }

    pub fn artifact_url(&self, digest: &str) -> String {
        format!("{}/artifacts/{}", self.base_url, digest.trim())
    }

    /// Fetch `descriptor` into `destination`, retrying up to the policy's cap.
    ///
    /// Returns the number of bytes written, or the last attempt's error once
    /// every attempt has failed. The destination's parent must already exist.
    pub async fn fetch(&self, descriptor: &FileDescriptor, destination: &Path) -> Result<u64, FetchError> {
        let url = self.artifact_url(&descriptor.digest);
        let mut attempt = 1;

        loop {
            match self.try_fetch(&url, descriptor, destination).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        info!("Fetched {} on attempt {}", descriptor.path, attempt);
                    }
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} for {} ({}) failed: {}",
                        attempt, self.retry.max_attempts, descriptor.path, descriptor.digest, e
                    );
                    remove_partial(destination).await;

                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_fetch(
        &self,
        url: &str,
        descriptor: &FileDescriptor,
        destination: &Path,
    ) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        let written = tokio::fs::metadata(destination).await?.len();
        if descriptor.size > 0 && written != descriptor.size {
            return Err(FetchError::SizeMismatch {
                expected: descriptor.size,
                actual: written,
            });
        }

        let path: PathBuf = destination.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || file_digest(&path))
            .await
            .map_err(std::io::Error::other)??;
        if !digests_equal(&actual, &descriptor.digest) {
            return Err(FetchError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }

        debug!("Verified {} ({} bytes)", descriptor.path, written);
        Ok(written)
    }
}

/// Delete a leftover file; absence is fine.
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{capture_logs, refused_base_url, sha256_hex, TestServer};
    use std::time::Instant;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }

    fn fetcher(server: &TestServer, retry: RetryPolicy) -> ArtifactFetcher {
        ArtifactFetcher::new(reqwest::Client::new(), &server.base_url, retry)
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(2), Duration::from_millis(400));
        assert_eq!(policy.delay_after(3), Duration::from_millis(600));
    }

    #[test]
    fn test_url_uses_digest_not_path() {
        let fetcher = ArtifactFetcher::new(reqwest::Client::new(), "http://cdn", RetryPolicy::default());
        assert_eq!(fetcher.artifact_url("deadbeef"), "http://cdn/artifacts/deadbeef");
    }

    #[tokio::test]
    async fn test_fetch_writes_verified_file() {
        let contents = vec![7u8; 1024];
        let digest = sha256_hex(&contents);
        let server = TestServer::builder().blob(&contents).start().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("b.bin");

        let descriptor = FileDescriptor::new("a/b.bin", digest.clone(), 1024);
        let written = fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap();

        assert_eq!(written, 1024);
        assert_eq!(std::fs::read(&dest).unwrap(), contents);
        assert_eq!(server.hits(&digest), 1);
    }

    #[tokio::test]
    async fn test_fetch_truncates_existing_file() {
        let contents = b"fresh".to_vec();
        let digest = sha256_hex(&contents);
        let server = TestServer::builder().blob(&contents).start().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("f");
        std::fs::write(&dest, b"a much longer stale payload").unwrap();

        let descriptor = FileDescriptor::new("f", digest, 0);
        fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_with_backoff() {
        let contents = b"eventually".to_vec();
        let digest = sha256_hex(&contents);
        let server = TestServer::builder()
            .blob(&contents)
            .fail_first(&digest, 2)
            .start()
            .await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("e");

        let descriptor = FileDescriptor::new("e", digest.clone(), contents.len() as u64);
        let (logs, _guard) = capture_logs();
        let started = Instant::now();
        fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap();

        // 50ms after attempt 1, 100ms after attempt 2
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(server.hits(&digest), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), contents);
        assert_eq!(logs.count("failed: server responded with status 503"), 2);
        assert_eq!(logs.count("Attempt 1/3 for e"), 1);
        assert_eq!(logs.count("Attempt 2/3 for e"), 1);
        assert_eq!(logs.count("Attempt 3/3"), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_retried() {
        let contents = vec![3u8; 64 * 1024];
        let digest = sha256_hex(&contents);
        let server = TestServer::builder()
            .blob(&contents)
            .drop_first(&digest, 2)
            .start()
            .await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("net");

        let descriptor = FileDescriptor::new("net", digest.clone(), contents.len() as u64);
        let (logs, _guard) = capture_logs();
        let written = fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap();

        assert_eq!(written, contents.len() as u64);
        assert_eq!(server.hits(&digest), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), contents);
        assert_eq!(logs.count("Attempt 1/3 for net"), 1);
        assert_eq!(logs.count("Attempt 2/3 for net"), 1);
        assert_eq!(logs.count("failed: transport error"), 2);
    }

    #[tokio::test]
    async fn test_refused_connection_exhausts_attempts() {
        let base_url = refused_base_url().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("offline");
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };

        let descriptor = FileDescriptor::new("offline", sha256_hex(b"x"), 1);
        let (logs, _guard) = capture_logs();
        let err = ArtifactFetcher::new(reqwest::Client::new(), base_url, retry)
            .fetch(&descriptor, &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(logs.count("for offline"), 3);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_missing_blob_is_retried_to_exhaustion() {
        let server = TestServer::builder().start().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("gone");

        let descriptor = FileDescriptor::new("gone", "00ff", 0);
        let err = fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap_err();

        assert!(matches!(err, FetchError::Status(s) if s == reqwest::StatusCode::NOT_FOUND));
        assert_eq!(server.hits("00ff"), 3);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_removes_file() {
        let contents = b"twelve bytes".to_vec();
        let digest = sha256_hex(&contents);
        let server = TestServer::builder().blob(&contents).start().await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("s");

        let descriptor = FileDescriptor::new("s", digest, 13);
        let err = fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.unwrap_err();

        assert!(matches!(err, FetchError::SizeMismatch { expected: 13, actual: 12 }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_digest_mismatch_removes_file() {
        let claimed = sha256_hex(b"what the manifest promised");
        let server = TestServer::builder()
            .blob_at(&claimed, b"what the server sent")
            .start()
            .await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("d");
        let single = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        };

        let descriptor = FileDescriptor::new("d", claimed.clone(), 0);
        let err = fetcher(&server, single).fetch(&descriptor, &dest).await.unwrap_err();

        assert!(matches!(err, FetchError::DigestMismatch { .. }));
        assert_eq!(server.hits(&claimed), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_uppercase_digest_accepted() {
        let contents = b"case".to_vec();
        let digest = sha256_hex(&contents);
        // Remote address is the digest as written in the manifest
        let server = TestServer::builder()
            .blob_at(&digest.to_uppercase(), &contents)
            .start()
            .await;
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("c");

        let descriptor = FileDescriptor::new("c", digest.to_uppercase(), 4);
        assert!(fetcher(&server, fast_retry()).fetch(&descriptor, &dest).await.is_ok());
    }

    #[test]
    fn test_policy_from_config_clamps_attempts() {
        let config = FetchConfig {
            max_attempts: 0,
            retry_base_delay_ms: 10,
            request_timeout_secs: 1,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }
}
