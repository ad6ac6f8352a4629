//! Typed wrappers around the `btrfs` admin CLI.
//!
//! Every function that shells out delegates its output parsing to a
//! standalone `parse_*` function so the parsing logic is unit-testable
//! without a real btrfs filesystem.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{HammerError, Result};
use crate::task::Task;

fn btrfs_err(stage: &str, stderr: String) -> HammerError {
    HammerError::Btrfs {
        stage: stage.to_string(),
        stderr,
    }
}

/// `btrfs subvolume snapshot [-r] <source> <dest>`.
pub(crate) fn snapshot(source: &Utf8Path, dest: &Utf8Path, writable: bool) -> Result<()> {
    let mut args = vec!["subvolume", "snapshot"];
    if !writable {
        args.push("-r");
    }
    let out = Task::new(format!("Snapshotting {source} to {dest}"), "btrfs")
        .args(args)
        .args([source.as_str(), dest.as_str()])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("snapshot", out.stderr_str()));
    }
    Ok(())
}

/// Enumerate the subvolumes nested under `source`, relative to `source`,
/// in an order where every parent precedes its children.
fn list_nested_relative(source: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let source_rel = subvol_name(source)?;
    let out = Task::new(format!("Listing subvolumes under {source}"), "btrfs")
        .args(["subvolume", "list", "-a", "--sort=path", source.as_str()])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("subvolume list", out.stderr_str()));
    }
    Ok(parse_nested_relative(&out.stdout_str(), &source_rel))
}

/// Parse `btrfs subvolume list -a --sort=path` output, returning the paths
/// of subvolumes strictly nested under `source_rel` (the source's own path
/// relative to the filesystem top, as returned by [`subvol_name`]),
/// expressed relative to `source_rel`.
fn parse_nested_relative(stdout: &str, source_rel: &str) -> Vec<Utf8PathBuf> {
    let prefix = if source_rel.is_empty() {
        String::new()
    } else {
        format!("{source_rel}/")
    };
    let mut out = Vec::new();
    for line in stdout.lines() {
        let Some(idx) = line.find(" path ") else {
            continue;
        };
        let mut path = line[idx + " path ".len()..].trim();
        path = path.strip_prefix("<FS_TREE>/").unwrap_or(path);
        if path == source_rel {
            continue;
        }
        if let Some(rel) = path.strip_prefix(&prefix) {
            if !rel.is_empty() {
                out.push(Utf8PathBuf::from(rel));
            }
        }
    }
    out
}

/// `snapshot_recursive`: snapshot `source` to `dest`, then for every
/// subvolume nested under `source`, remove the placeholder directory the
/// top-level snapshot left behind at the matching `dest` path and snapshot
/// the nested subvolume into it. Parents are processed before children
/// because `parse_nested_relative` preserves the sorted-by-path order the
/// `btrfs` CLI already produced.
pub(crate) fn snapshot_recursive(source: &Utf8Path, dest: &Utf8Path, writable: bool) -> Result<()> {
    snapshot(source, dest, writable)?;
    for rel in list_nested_relative(source)? {
        let nested_src = source.join(&rel);
        let nested_dst = dest.join(&rel);
        if nested_dst.is_dir() {
            std::fs::remove_dir(&nested_dst).map_err(|e| {
                HammerError::Other(anyhow::anyhow!(
                    "removing snapshot placeholder {nested_dst}: {e}"
                ))
            })?;
        }
        snapshot(&nested_src, &nested_dst, writable)?;
    }
    Ok(())
}

/// `btrfs property set -ts <path> ro <value>`.
pub(crate) fn set_ro(path: &Utf8Path, ro: bool) -> Result<()> {
    let out = Task::new(format!("Setting ro={ro} on {path}"), "btrfs")
        .args([
            "property",
            "set",
            "-ts",
            path.as_str(),
            "ro",
            if ro { "true" } else { "false" },
        ])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("property set ro", out.stderr_str()));
    }
    Ok(())
}

/// Apply [`set_ro`] to `path` and to every nested subvolume, in the same
/// enumeration order `snapshot_recursive` used to create them.
pub(crate) fn set_ro_recursive(path: &Utf8Path, ro: bool) -> Result<()> {
    set_ro(path, ro)?;
    for rel in list_nested_relative(path)? {
        set_ro(&path.join(rel), ro)?;
    }
    Ok(())
}

/// `btrfs property get -ts <path> ro`, parsing the trailing `true`/`false`.
pub(crate) fn is_ro(path: &Utf8Path) -> Result<bool> {
    let out = Task::new(format!("Getting ro property of {path}"), "btrfs")
        .args(["property", "get", "-ts", path.as_str(), "ro"])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("property get ro", out.stderr_str()));
    }
    Ok(parse_ro_property(&out.stdout_str()))
}

/// Parse `ro=true`/`ro=false` out of `btrfs property get` output.
fn parse_ro_property(stdout: &str) -> bool {
    stdout.trim().ends_with("true")
}

/// Parse the `Subvolume ID:` line out of `btrfs subvolume show` output.
fn parse_subvol_id(stdout: &str) -> Option<u64> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Subvolume ID:")?;
        rest.trim().parse().ok()
    })
}

/// `btrfs subvolume show <path>`, parsing the `Subvolume ID:` field.
pub(crate) fn subvol_id(path: &Utf8Path) -> Result<u64> {
    let out = Task::new(format!("Showing subvolume {path}"), "btrfs")
        .args(["subvolume", "show", path.as_str()])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("subvolume show", out.stderr_str()));
    }
    parse_subvol_id(&out.stdout_str())
        .ok_or_else(|| HammerError::Btrfs {
            stage: "subvolume show".into(),
            stderr: format!("no Subvolume ID in output for {path}"),
        })
}

/// Parse the first non-empty line of `btrfs subvolume show` output, which
/// carries the subvolume's own path relative to the filesystem top.
/// `<FS_TREE>` or `/` denotes the top-level subvolume itself, reported as
/// the empty string.
fn parse_subvol_name(stdout: &str) -> String {
    let first = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let first = first.trim();
    if first == "<FS_TREE>" || first == "/" {
        String::new()
    } else {
        first.to_string()
    }
}

/// `btrfs subvolume show <path>`, parsing the leading path line.
pub(crate) fn subvol_name(path: &Utf8Path) -> Result<String> {
    let out = Task::new(format!("Showing subvolume {path}"), "btrfs")
        .args(["subvolume", "show", path.as_str()])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("subvolume show", out.stderr_str()));
    }
    Ok(parse_subvol_name(&out.stdout_str()))
}

/// `btrfs subvolume set-default <id> /`.
pub(crate) fn set_default(id: u64) -> Result<()> {
    let out = Task::new(format!("Setting default subvolume to {id}"), "btrfs")
        .args(["subvolume", "set-default", &id.to_string(), "/"])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("set-default", out.stderr_str()));
    }
    Ok(())
}

/// `btrfs subvolume delete <path>`.
pub(crate) fn delete(path: &Utf8Path) -> Result<()> {
    let out = Task::new(format!("Deleting subvolume {path}"), "btrfs")
        .args(["subvolume", "delete", path.as_str()])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("subvolume delete", out.stderr_str()));
    }
    Ok(())
}

/// Parse the `uuid:` field out of `btrfs filesystem show` output.
fn parse_fs_uuid(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        if let Some(idx) = lower.find("uuid:") {
            let rest = line[idx + "uuid:".len()..].trim();
            let uuid = rest.split_whitespace().next()?;
            return Some(uuid.to_string());
        }
    }
    None
}

/// `btrfs filesystem show /`, parsing the filesystem UUID.
pub(crate) fn fs_uuid() -> Result<String> {
    let out = Task::new("Showing filesystem", "btrfs")
        .args(["filesystem", "show", "/"])
        .run()
        .map_err(HammerError::Other)?;
    if !out.success {
        return Err(btrfs_err("filesystem show", out.stderr_str()));
    }
    parse_fs_uuid(&out.stdout_str()).ok_or_else(|| HammerError::Btrfs {
        stage: "filesystem show".into(),
        stderr: "no uuid field in output".into(),
    })
}

/// Directory entries of the deployments root whose name carries the
/// `hammer-` prefix. Plain filesystem enumeration, not a `btrfs` CLI call;
/// kept alongside the other subvolume helpers since callers reach for it
/// in the same places.
pub(crate) fn list_deployments(deployments_dir: &Utf8Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(deployments_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(crate::config::DEPLOYMENT_PREFIX) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subvol_id() {
        let out = "deployments/hammer-A\n\tName: \t\t\thammer-A\n\tUUID: \t\t\tabc\n\tSubvolume ID:\t\t262\n\tGeneration: \t\t10\n";
        assert_eq!(parse_subvol_id(out), Some(262));
    }

    #[test]
    fn test_parse_subvol_id_missing() {
        assert_eq!(parse_subvol_id("no such field here"), None);
    }

    #[test]
    fn test_parse_subvol_name_top() {
        assert_eq!(parse_subvol_name("<FS_TREE>\n\tName: ...\n"), "");
        assert_eq!(parse_subvol_name("/\n\tName: ...\n"), "");
    }

    #[test]
    fn test_parse_subvol_name_nested() {
        assert_eq!(
            parse_subvol_name("\n\ndeployments/hammer-A\n\tName: ...\n"),
            "deployments/hammer-A"
        );
    }

    #[test]
    fn test_parse_nested_relative_top() {
        let stdout = "\
ID 256 gen 5 top level 5 path <FS_TREE>/deployments
ID 257 gen 9 top level 256 path <FS_TREE>/deployments/hammer-A
ID 258 gen 9 top level 257 path <FS_TREE>/deployments/hammer-A/var
ID 259 gen 9 top level 257 path <FS_TREE>/deployments/hammer-A/var/lib/docker
ID 260 gen 9 top level 256 path <FS_TREE>/deployments/hammer-B
";
        let rel = parse_nested_relative(stdout, "deployments/hammer-A");
        assert_eq!(
            rel,
            vec![
                Utf8PathBuf::from("var"),
                Utf8PathBuf::from("var/lib/docker"),
            ]
        );
    }

    #[test]
    fn test_parse_nested_relative_from_fs_top() {
        let stdout = "\
ID 256 gen 5 top level 5 path deployments
ID 257 gen 9 top level 256 path deployments/hammer-A
";
        let rel = parse_nested_relative(stdout, "");
        assert_eq!(
            rel,
            vec![
                Utf8PathBuf::from("deployments"),
                Utf8PathBuf::from("deployments/hammer-A"),
            ]
        );
    }

    #[test]
    fn test_parse_ro_property() {
        assert!(parse_ro_property("ro=true"));
        assert!(!parse_ro_property("ro=false"));
    }

    #[test]
    fn test_parse_fs_uuid() {
        let stdout = "Label: none  uuid: 1234-5678-90ab-cdef\n\tTotal devices 1 FS bytes used 10GiB\n\tdevid 1 size 20GiB used 10GiB path /dev/vda2\n";
        assert_eq!(
            parse_fs_uuid(stdout),
            Some("1234-5678-90ab-cdef".to_string())
        );
    }

    #[test]
    fn test_list_deployments_filters_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let base = camino::Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir(base.join("hammer-20240101000000")).unwrap();
        std::fs::create_dir(base.join("hammer-20240102000000")).unwrap();
        std::fs::create_dir(base.join("not-a-deployment")).unwrap();
        let mut names = list_deployments(base).unwrap();
        names.sort();
        assert_eq!(
            names,
            vec![
                "hammer-20240101000000".to_string(),
                "hammer-20240102000000".to_string(),
            ]
        );
    }

    #[test]
    fn test_list_deployments_missing_dir() {
        let names = list_deployments(Utf8Path::new("/nonexistent/does-not-exist")).unwrap();
        assert!(names.is_empty());
    }
}
