//! SHA-256 content digests and the local integrity check.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the lowercase hex SHA-256 digest of a file's contents.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare two hex digests ignoring case.
pub fn digests_equal(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

/// Returns true when the file at `path` exists and its digest equals `expected`.
///
/// Never fails: a missing file is a plain mismatch, and any read error is
/// logged and also reported as a mismatch so the caller re-downloads.
pub fn digest_matches(path: &Path, expected: &str) -> bool {
    match path.try_exists() {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            warn!("Cannot stat {}: {}", path.display(), e);
            return false;
        }
    }

    match file_digest(path) {
        Ok(actual) => {
            let matches = digests_equal(&actual, expected);
            if !matches {
                debug!("Stale file {}: have {}, want {}", path.display(), actual, expected);
            }
            matches
        }
        Err(e) => {
            warn!("Failed to hash {}: {}", path.display(), e);
            false
        }
    }
}
