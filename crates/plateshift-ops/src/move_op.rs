//! Move-specific steps around a copy: the rename fast path and source removal.

use std::fs;
use std::io;
use std::path::Path;

use plateshift_core::{OperationId, TransferWarning};
use tracing::{debug, warn};

/// Try to move `source` with a single rename.
///
/// Returns `true` when the rename succeeded. Any failure, including a
/// cross-device move, returns `false` so the caller falls back to copy and
/// delete.
pub(crate) fn try_rename(source: &Path, destination: &Path) -> bool {
    match fs::rename(source, destination) {
        Ok(()) => {
            debug!("renamed {} -> {}", source.display(), destination.display());
            true
        }
        Err(e) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                source.display(),
                destination.display(),
                e
            );
            false
        }
    }
}

/// Remove the source of a verified move.
///
/// A failure leaves the operation successful but produces a warning.
pub(crate) fn remove_source(operation_id: OperationId, source: &Path) -> Option<TransferWarning> {
    match fs::remove_file(source) {
        Ok(()) => None,
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("moved {} but could not remove it: {}", source.display(), e);
            Some(TransferWarning::source_delete_failed(operation_id, source, &e))
        }
    }
}

/// Check whether two paths name the same existing file.
///
/// Compares file identity, so hard links and symlinks to one file match.
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    ::same_file::is_same_file(a, b).unwrap_or(false)
}
