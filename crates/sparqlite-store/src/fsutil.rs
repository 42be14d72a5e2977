//! Filesystem helpers

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Free bytes on the filesystem holding `path`
pub fn available_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

/// Whether the filesystem holding `path` has at least `required` free bytes.
///
/// An unreadable filesystem counts as full.
pub fn has_enough_space(path: &Path, required: u64) -> bool {
    match available_space(path) {
        Ok(available) => {
            if available < required {
                warn!(path = ?path, available, required, "Not enough free space");
            }
            available >= required
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Could not query free space");
            false
        }
    }
}

/// Size of the file at `path`, 0 when it does not exist
pub fn file_size(path: &Path) -> io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Modification time of `path` in seconds since the epoch
pub fn modified_secs(path: &Path) -> io::Result<u64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}

/// Current time in seconds since the epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Delete `path`; returns whether something was deleted
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = ?path, "Removed file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Collation locale of the process, from the usual environment variables
pub fn process_collation_locale() -> String {
    ["LC_ALL", "LC_COLLATE", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "C".to_string())
}
