//! System version: a content-addressed identity for a deployment, derived
//! from its installed-package listing.

use camino::Utf8Path;
use sha2::{Digest, Sha256};

use crate::error::{HammerError, Result};

/// Hash `<deployment>/tmp/packages.list` (produced by the chroot package
/// tool dump step) with SHA-256, returning the lowercase hex digest, then
/// delete the file. Absence of the file is a sanity failure rather than a
/// generic I/O error: a missing package list means the chroot work never
/// completed the dump step.
pub(crate) fn compute_and_remove(deployment: &Utf8Path) -> Result<String> {
    let path = deployment.join("tmp").join("packages.list");
    let bytes = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HammerError::Sanity(format!("{path} is missing"))
        } else {
            HammerError::Other(e.into())
        }
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    std::fs::remove_file(&path)?;
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_and_remove_hashes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("tmp")).unwrap();
        let list_path = root.join("tmp/packages.list");
        std::fs::write(&list_path, b"ii  bash  5.2-1  amd64\n").unwrap();

        let digest = compute_and_remove(root).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(!list_path.exists());

        // Deterministic: same input hashes to the same digest.
        std::fs::write(&list_path, b"ii  bash  5.2-1  amd64\n").unwrap();
        let digest2 = compute_and_remove(root).unwrap();
        assert_eq!(digest, digest2);
    }

    #[test]
    fn test_missing_file_is_sanity_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let err = compute_and_remove(root).unwrap_err();
        assert!(matches!(err, HammerError::Sanity(_)));
    }
}
