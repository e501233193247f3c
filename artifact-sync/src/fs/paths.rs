//! Mapping manifest paths onto the destination tree.

use crate::utils::errors::InvalidEntry;
use std::path::{Path, PathBuf};

/// Join a manifest-relative path onto `root` using platform separators.
///
/// Both `/` and `\` are accepted as separators; empty and `.` segments are
/// dropped. Absolute paths, drive prefixes and `..` segments are rejected so
/// the result always stays under `root`.
pub fn resolve_destination(root: &Path, manifest_path: &str) -> Result<PathBuf, InvalidEntry> {
    let unsafe_path = || InvalidEntry::UnsafePath(manifest_path.to_string());

    if manifest_path.starts_with('/') || manifest_path.starts_with('\\') {
        return Err(unsafe_path());
    }

    let mut destination = root.to_path_buf();
    let mut segments = 0usize;

    for segment in manifest_path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(unsafe_path()),
            // Drive letters and other prefixes ("C:", "c:foo")
            s if s.contains(':') => return Err(unsafe_path()),
            s => {
                destination.push(s);
                segments += 1;
            }
        }
    }

    if segments == 0 {
        return Err(InvalidEntry::BlankPath);
    }

    Ok(destination)
}
