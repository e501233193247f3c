//! Manifest types and retrieval.
//!
//! A manifest lists every file that must exist for one revision, each
//! identified by its SHA-256 digest. It is published by the artifact server
//! at `{base_url}/manifests/{revision}.json`:
//!
//! ```json
//! { "commit": "abc123", "files": [ { "path": "a/b.bin", "sha256": "…", "size": 1024 } ] }
//! ```
//!
//! Field names are matched case-insensitively.

use crate::utils::errors::{InvalidEntry, Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// The set of files expected for a single revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "commit", default, deserialize_with = "null_as_default")]
    pub revision: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileDescriptor>,
}

/// One expected file: where it goes, what it hashes to, how big it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Path relative to the destination root
    #[serde(default, deserialize_with = "null_as_default")]
    pub path: String,

    /// Hex SHA-256 of the contents; also the blob's remote address
    #[serde(rename = "sha256", default, deserialize_with = "null_as_default")]
    pub digest: String,

    /// Expected length in bytes; 0 means unchecked
    #[serde(default, deserialize_with = "null_as_default")]
    pub size: u64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Manifest {
    /// Decode a manifest document, accepting field names in any case.
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        serde_json::from_value(lowercase_keys(value))
    }

    /// Reject the manifest wholesale unless it was published for `requested`.
    pub fn verify_revision(&self, requested: &str) -> Result<()> {
        if self.revision != requested {
            return Err(SyncError::RevisionMismatch {
                requested: requested.to_string(),
                declared: self.revision.clone(),
            });
        }
        Ok(())
    }

    /// Sum of declared sizes (entries with unknown size count as zero).
    pub fn declared_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

impl FileDescriptor {
    pub fn new(path: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
            size,
        }
    }

    /// Blank paths or digests make an entry unusable.
    pub fn validate(&self) -> std::result::Result<(), InvalidEntry> {
        if self.path.trim().is_empty() {
            return Err(InvalidEntry::BlankPath);
        }
        if self.digest.trim().is_empty() {
            return Err(InvalidEntry::BlankDigest(self.path.clone()));
        }
        Ok(())
    }
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Fetches manifests from the artifact server.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: reqwest::Client,
    base_url: String,
}

impl ManifestResolver {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn manifest_url(&self, revision: &str) -> String {
        format!("{}/manifests/{}.json", self.base_url, revision)
    }

    /// Download and decode the manifest for `revision`.
    ///
    /// A 404 is reported as [`SyncError::ManifestNotFound`]; every other
    /// failure (status, transport, malformed body) is a transport-class error.
    pub async fn fetch(&self, revision: &str) -> Result<Manifest> {
        let url = self.manifest_url(revision);
        let transport = |source| SyncError::ManifestTransport {
            revision: revision.to_string(),
            source,
        };

        let response = self.client.get(&url).send().await.map_err(transport)?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            warn!("No manifest published at {}", url);
            return Err(SyncError::ManifestNotFound {
                revision: revision.to_string(),
            });
        }
        if !status.is_success() {
            warn!("Manifest request {} returned {}", url, status);
            return Err(SyncError::ManifestStatus {
                revision: revision.to_string(),
                status,
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        let manifest = Manifest::from_json(&body).map_err(|source| SyncError::ManifestParse {
            revision: revision.to_string(),
            source,
        })?;

        info!(
            "Fetched manifest for {}: {} files, {} bytes declared",
            revision,
            manifest.files.len(),
            manifest.declared_bytes()
        );
        Ok(manifest)
    }

    /// Fetch the manifest and require that it declares `revision`.
    pub async fn fetch_verified(&self, revision: &str) -> Result<Manifest> {
        let manifest = self.fetch(revision).await?;
        manifest.verify_revision(revision)?;
        Ok(manifest)
    }
}
