//! Per-deployment `meta.json` reading, writing, and merging.
//!
//! Metadata is modeled as a typed [`DeploymentMeta`] record, but `read` and
//! `update` still round-trip through a bare `serde_json::Map` so that
//! unknown keys left behind by a hand-edited `meta.json` survive a merge
//! instead of being silently dropped.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HammerError, Result};

/// Where a deployment sits in the boot/retention lifecycle. Absent from
/// this enum on purpose: the pre-metadata "writable" state, which has no
/// `meta.json` yet at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Chroot work, sanity check, and sealing all succeeded; not yet booted.
    Ready,
    /// Promoted to `ready`'s successor after a boot-time reconciliation
    /// confirmed `current` resolved to this deployment.
    Booted,
    /// Superseded by a later `switch`/`rollback` target.
    Previous,
    /// The transaction that produced this deployment failed, or boot-time
    /// reconciliation found `current` pointing elsewhere.
    Broken,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Ready => "ready",
            DeploymentStatus::Booted => "booted",
            DeploymentStatus::Previous => "previous",
            DeploymentStatus::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// The typed shape of `<deployment>/meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMeta {
    /// When this deployment's writable snapshot was taken, in UTC.
    pub created: DateTime<Utc>,
    /// Free-form action that produced this deployment (`"initial"`, `"update"`, `"install <pkg>"`, ...).
    pub action: String,
    /// Name of the deployment this one was snapshotted from, or empty for the first deployment.
    #[serde(default)]
    pub parent: String,
    /// Kernel version string matching `/boot/vmlinuz-<kernel>` inside the deployment.
    #[serde(default)]
    pub kernel: String,
    /// Hex SHA-256 of the deployment's installed-package listing.
    #[serde(default)]
    pub system_version: String,
    /// Where this deployment sits in the boot/retention lifecycle.
    pub status: DeploymentStatus,
    /// Why this deployment was demoted, when known (set by `switch`/`rollback`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

fn meta_path(deployment: &Utf8Path) -> camino::Utf8PathBuf {
    deployment.join("meta.json")
}

/// Write `meta.json` atomically: serialize to a sibling temp file, then
/// rename over the real path. Single-writer access is enforced by
/// [`crate::lock::LockGuard`] at the call sites, not by this function.
pub(crate) fn write(deployment: &Utf8Path, meta: &DeploymentMeta) -> Result<()> {
    let path = meta_path(deployment);
    let tmp = deployment.join("meta.json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(meta)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Read `meta.json` as an untyped key/value map. A missing file is not an
/// error; it returns an empty map, matching a deployment that predates
/// metadata or has none yet.
pub(crate) fn read(deployment: &Utf8Path) -> Result<Map<String, Value>> {
    let path = meta_path(deployment);
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(serde_json::from_str(&s)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}

/// Read `meta.json` and deserialize it into [`DeploymentMeta`]. Unlike
/// [`read`], a missing or malformed file is an error here: every caller of
/// `read_typed` needs the typed fields to make a decision.
pub(crate) fn read_typed(deployment: &Utf8Path) -> Result<DeploymentMeta> {
    let path = meta_path(deployment);
    let s = std::fs::read_to_string(&path)
        .map_err(|e| HammerError::Meta(format!("reading {path}: {e}")))?;
    serde_json::from_str(&s).map_err(|e| HammerError::Meta(format!("parsing {path}: {e}")))
}

/// Merge `patch` into the existing document (creating one if absent) and
/// write it back. Keys in `patch` overwrite keys in the existing document;
/// keys present only in the existing document are preserved.
pub(crate) fn update(deployment: &Utf8Path, patch: Map<String, Value>) -> Result<()> {
    let mut doc = read(deployment)?;
    for (k, v) in patch {
        doc.insert(k, v);
    }
    let path = meta_path(deployment);
    let tmp = deployment.join("meta.json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Convenience for the common single-field status update used throughout
/// the engine (promote/demote/mark-broken).
pub(crate) fn set_status(
    deployment: &Utf8Path,
    status: DeploymentStatus,
    rollback_reason: Option<&str>,
) -> Result<()> {
    let mut patch = Map::new();
    patch.insert("status".into(), Value::String(status.to_string()));
    if let Some(reason) = rollback_reason {
        patch.insert("rollback_reason".into(), Value::String(reason.into()));
    }
    update(deployment, patch)
}

/// Every `hammer-` prefixed deployment under `deployments_dir` that has
/// metadata, paired with its parsed metadata, sorted by `created`
/// descending (newest first). Deployments with no `meta.json` (still
/// writable, never reached `ready`) are skipped.
pub(crate) fn all_with_meta_newest_first(
    deployments_dir: &Utf8Path,
) -> Result<Vec<(String, DeploymentMeta)>> {
    let mut out = Vec::new();
    for name in crate::btrfs::list_deployments(deployments_dir)? {
        let path = deployments_dir.join(&name);
        match read_typed(&path) {
            Ok(meta) => out.push((name, meta)),
            Err(_) => continue,
        }
    }
    out.sort_by(|a, b| b.1.created.cmp(&a.1.created));
    Ok(out)
}

/// The newest `limit` deployments whose status is `ready` or `booted`,
/// newest first. This is the set [`crate::bootentries`] renders into the
/// boot menu and [`crate::engine`]'s `clean` retains.
pub(crate) fn good_deployments_newest_first(
    deployments_dir: &Utf8Path,
    limit: usize,
) -> Result<Vec<(String, DeploymentMeta)>> {
    let mut all = all_with_meta_newest_first(deployments_dir)?;
    all.retain(|(_, m)| matches!(m.status, DeploymentStatus::Ready | DeploymentStatus::Booted));
    all.truncate(limit);
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(status: DeploymentStatus) -> DeploymentMeta {
        DeploymentMeta {
            created: "2024-01-01T00:00:00Z".parse().unwrap(),
            action: "initial".into(),
            parent: String::new(),
            kernel: "6.1.0-amd64".into(),
            system_version: "abcd".into(),
            status,
            rollback_reason: None,
        }
    }

    #[test]
    fn test_write_read_typed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        let meta = sample_meta(DeploymentStatus::Ready);
        write(path, &meta).unwrap();
        let back = read_typed(path).unwrap();
        similar_asserts::assert_eq!(back, meta);
    }

    #[test]
    fn test_read_missing_is_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        assert!(read(path).unwrap().is_empty());
    }

    #[test]
    fn test_update_preserves_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        let mut initial = Map::new();
        initial.insert("created".into(), Value::String("2024-01-01T00:00:00Z".into()));
        initial.insert("action".into(), Value::String("initial".into()));
        initial.insert("status".into(), Value::String("ready".into()));
        initial.insert("hand_edited_note".into(), Value::String("keep me".into()));
        update(path, initial).unwrap();

        let mut patch = Map::new();
        patch.insert("status".into(), Value::String("booted".into()));
        update(path, patch).unwrap();

        let doc = read(path).unwrap();
        assert_eq!(doc["status"], Value::String("booted".into()));
        assert_eq!(doc["hand_edited_note"], Value::String("keep me".into()));
    }

    #[test]
    fn test_set_status_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        write(path, &sample_meta(DeploymentStatus::Ready)).unwrap();
        set_status(path, DeploymentStatus::Previous, Some("manual")).unwrap();
        let back = read_typed(path).unwrap();
        assert_eq!(back.status, DeploymentStatus::Previous);
        assert_eq!(back.rollback_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn test_good_deployments_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        for (name, status, created) in [
            ("hammer-20240101000000", DeploymentStatus::Previous, "2024-01-01T00:00:00Z"),
            ("hammer-20240102000000", DeploymentStatus::Booted, "2024-01-02T00:00:00Z"),
            ("hammer-20240103000000", DeploymentStatus::Broken, "2024-01-03T00:00:00Z"),
            ("hammer-20240104000000", DeploymentStatus::Ready, "2024-01-04T00:00:00Z"),
        ] {
            let dep = base.join(name);
            std::fs::create_dir_all(&dep).unwrap();
            let mut m = sample_meta(status);
            m.created = created.parse().unwrap();
            write(&dep, &m).unwrap();
        }
        let good = good_deployments_newest_first(base, 5).unwrap();
        let names: Vec<_> = good.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["hammer-20240104000000", "hammer-20240102000000"]
        );
    }
}
