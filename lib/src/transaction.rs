//! The transaction marker: a file at `<btrfs_root>/hammer-transaction`
//! naming the deployment an in-progress operation is building, present
//! from the moment a new deployment's writable snapshot is taken until the
//! ordering guarantees in the design document are satisfied and the
//! deployment is sealed read-only.
//!
//! If `hammer` (or the host) dies mid-operation, the marker survives and is
//! picked up by `check-transaction` (typically run at boot, before
//! anything else touches `/btrfs-root`): the named deployment is marked
//! `broken` and the marker is removed, so a half-built deployment never
//! silently becomes the default.
//!
//! Write form is always the JSON object `{"deployment": "<name>"}`. Read
//! additionally accepts a bare deployment name with no JSON wrapping, for
//! compatibility with a marker written by an older version of this tool.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct TransactionMarker {
    pub(crate) deployment: String,
}

/// Write the marker naming `deployment`. Overwrites any marker already
/// present — callers are expected to have checked via [`read`] that no
/// unrelated transaction is in flight before calling this within a
/// held [`crate::lock::LockGuard`].
pub(crate) fn create(path: &Utf8Path, deployment: &str) -> Result<()> {
    let marker = TransactionMarker {
        deployment: deployment.to_string(),
    };
    std::fs::write(path, serde_json::to_string(&marker)?)?;
    Ok(())
}

/// Read the marker, if present. Returns `Ok(None)` if no marker file
/// exists; an absent marker is the expected steady state.
pub(crate) fn read(path: &Utf8Path) -> Result<Option<TransactionMarker>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let trimmed = contents.trim();
    if let Ok(marker) = serde_json::from_str::<TransactionMarker>(trimmed) {
        return Ok(Some(marker));
    }
    Ok(Some(TransactionMarker {
        deployment: trimmed.to_string(),
    }))
}

/// Remove the marker. A no-op (not an error) if it's already gone.
pub(crate) fn remove(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("hammer-transaction");
        create(&path, "hammer-20240101000000").unwrap();
        let marker = read(&path).unwrap().unwrap();
        assert_eq!(marker.deployment, "hammer-20240101000000");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.trim_start().starts_with('{'));
    }

    #[test]
    fn test_read_legacy_raw_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("hammer-transaction");
        std::fs::write(&path, "hammer-20240101000000\n").unwrap();
        let marker = read(&path).unwrap().unwrap();
        assert_eq!(marker.deployment, "hammer-20240101000000");
    }

    #[test]
    fn test_read_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("hammer-transaction");
        assert!(read(&path).unwrap().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("hammer-transaction");
        remove(&path).unwrap();
        create(&path, "hammer-x").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
