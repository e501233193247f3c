//! Local file tree: digests, integrity checks and destination paths.

pub mod digest;
pub mod paths;

pub use digest::{digest_matches, file_digest};
pub use paths::resolve_destination;
