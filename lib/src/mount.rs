//! Mountpoint inspection and the chroot pseudo-filesystem harness.
//!
//! [`ChrootGuard`] uses RAII instead of exception-driven cleanup: the bind
//! mounts it sets up in [`ChrootGuard::enter`]
//! are torn down in reverse order by its `Drop` impl, so an early return or
//! a `?` partway through a chroot command still leaves the host mount
//! namespace clean.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::error::HammerError;
use crate::task::Task;

fn mount_err(stage: &str, stderr: String) -> HammerError {
    HammerError::Mount {
        stage: stage.to_string(),
        stderr,
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Filesystem {
    // Note if you add an entry to this list, you need to change the --output invocation below too
    pub(crate) source: String,
    pub(crate) fstype: String,
    pub(crate) options: String,
    pub(crate) uuid: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Findmnt {
    pub(crate) filesystems: Vec<Filesystem>,
}

#[context("Inspecting filesystem {path}")]
pub(crate) fn inspect_filesystem(path: &Utf8Path) -> Result<Filesystem> {
    let o = Task::new(format!("Inspecting {path}"), "findmnt")
        .args([
            "-J",
            "-v",
            // If you change this you probably also want to change the Filesystem struct above
            "--output=SOURCE,FSTYPE,OPTIONS,UUID",
            path.as_str(),
        ])
        .read()?;
    let o: Findmnt = serde_json::from_str(&o).context("Parsing findmnt output")?;
    o.filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("findmnt returned no data for {path}"))
}

fn bind_mount(source: &Utf8Path, target: &Utf8Path) -> crate::error::Result<()> {
    let out = Task::new(
        format!("Bind-mounting {source} at {target}"),
        "mount",
    )
    .args(["--bind", source.as_str(), target.as_str()])
    .run()
    .map_err(|e| mount_err("bind mount", e.to_string()))?;
    if !out.success {
        return Err(mount_err("bind mount", out.stderr_str()));
    }
    Ok(())
}

fn mount_devpts(target: &Utf8Path) -> crate::error::Result<()> {
    let out = Task::new(format!("Mounting devpts at {target}"), "mount")
        .args(["-t", "devpts", "devpts", target.as_str()])
        .run()
        .map_err(|e| mount_err("mount devpts", e.to_string()))?;
    if !out.success {
        return Err(mount_err("mount devpts", out.stderr_str()));
    }
    Ok(())
}

fn mount_tmpfs(target: &Utf8Path) -> crate::error::Result<()> {
    let out = Task::new(format!("Mounting tmpfs at {target}"), "mount")
        .args(["-t", "tmpfs", "tmpfs", target.as_str()])
        .run()
        .map_err(|e| mount_err("mount tmpfs", e.to_string()))?;
    if !out.success {
        return Err(mount_err("mount tmpfs", out.stderr_str()));
    }
    Ok(())
}

fn umount(target: &Utf8Path) -> crate::error::Result<()> {
    let out = Task::new(format!("Unmounting {target}"), "umount")
        .args([target.as_str()])
        .run()
        .map_err(|e| mount_err("umount", e.to_string()))?;
    if !out.success {
        return Err(mount_err("umount", out.stderr_str()));
    }
    Ok(())
}

/// The pseudo-filesystems bind-mounted (or freshly mounted) into a
/// deployment before a chroot command runs, in the order they're set up
/// (and the reverse order they come down).
const CHROOT_MOUNTS: &[&str] = &["proc", "sys", "dev", "dev/pts", "dev/shm"];

/// Bind-mounts `/proc`, `/sys`, `/dev`, plus a fresh `devpts` at
/// `dev/pts` and a fresh `tmpfs` at `dev/shm`, all rooted under a
/// deployment directory. Dropping the guard unmounts everything it
/// successfully mounted, in reverse order, logging (not failing on) any
/// unmount that doesn't succeed — the deployment directory may already be
/// gone by the time cleanup runs during error unwinding.
pub(crate) struct ChrootGuard {
    root: Utf8PathBuf,
    mounted: Vec<Utf8PathBuf>,
}

impl ChrootGuard {
    pub(crate) fn enter(root: &Utf8Path) -> Result<Self> {
        let mut guard = ChrootGuard {
            root: root.to_owned(),
            mounted: Vec::with_capacity(CHROOT_MOUNTS.len()),
        };
        for rel in ["proc", "sys", "dev"] {
            let target = root.join(rel);
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating chroot mountpoint {target}"))?;
            bind_mount(Utf8Path::new(&format!("/{rel}")), &target)?;
            guard.mounted.push(target);
        }
        let devpts = root.join("dev/pts");
        std::fs::create_dir_all(&devpts)
            .with_context(|| format!("creating chroot mountpoint {devpts}"))?;
        mount_devpts(&devpts)?;
        guard.mounted.push(devpts);

        let shm = root.join("dev/shm");
        std::fs::create_dir_all(&shm)
            .with_context(|| format!("creating chroot mountpoint {shm}"))?;
        mount_tmpfs(&shm)?;
        guard.mounted.push(shm);

        Ok(guard)
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl Drop for ChrootGuard {
    fn drop(&mut self) {
        for target in self.mounted.iter().rev() {
            if let Err(e) = umount(target) {
                tracing::warn!(%target, error = %e, "failed to tear down chroot mount");
            }
        }
    }
}

/// Parse `findmnt -no SOURCE /` output, stripping any trailing `[subvol]`
/// decoration (e.g. `/dev/vda2[/deployments/hammer-A]` -> `/dev/vda2`).
fn parse_root_device(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.split('[').next().unwrap_or(first).to_string())
}

/// Resolve the block device backing `/`, per [`parse_root_device`].
pub(crate) fn resolve_root_device() -> crate::error::Result<String> {
    let out = Task::new("Resolving root device", "findmnt")
        .args(["-no", "SOURCE", "/"])
        .run()
        .map_err(|e| mount_err("resolve root device", e.to_string()))?;
    if !out.success {
        return Err(mount_err("resolve root device", out.stderr_str()));
    }
    parse_root_device(&out.stdout_str())
        .ok_or_else(|| mount_err("resolve root device", "findmnt returned no source for /".to_string()))
}

/// If `top_path` is not already a mountpoint, create it and bind-mount the
/// whole filesystem (`subvol=/`) there. Idempotent: a second call against an
/// already-mounted `top_path` does nothing.
pub(crate) fn ensure_top_mounted(top_path: &Utf8Path) -> crate::error::Result<()> {
    let already = Task::new(format!("Checking mount of {top_path}"), "mountpoint")
        .args(["-q", top_path.as_str()])
        .run()
        .map_err(|e| mount_err("check mountpoint", e.to_string()))?
        .success;
    if already {
        return Ok(());
    }
    std::fs::create_dir_all(top_path).map_err(|e| {
        HammerError::Other(anyhow::Error::new(e).context(format!("creating mountpoint {top_path}")))
    })?;
    let device = resolve_root_device()?;
    let out = Task::new(format!("Mounting filesystem top at {top_path}"), "mount")
        .args(["-o", "subvol=/", &device, top_path.as_str()])
        .run()
        .map_err(|e| mount_err("mount filesystem top", e.to_string()))?;
    if !out.success {
        return Err(mount_err("mount filesystem top", out.stderr_str()));
    }
    Ok(())
}

fn copy_resolv_conf(root: &Utf8Path) {
    let dest = root.join("etc/resolv.conf");
    if let Some(parent) = dest.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::copy("/etc/resolv.conf", &dest) {
        tracing::warn!(error = %e, "failed to copy /etc/resolv.conf into chroot workspace");
    }
}

/// A disposable chroot environment for a single deployment subvolume:
/// a fresh temp directory, the deployment's subvolume mounted there, the
/// usual pseudo-filesystem binds from [`ChrootGuard`], and a best-effort
/// `/etc/resolv.conf` copy so the chroot's package tool can resolve hosts.
///
/// `Drop` tears down in the inverse order of construction: the pseudo-fs
/// binds first (via the inner `ChrootGuard`), then the device mount, then
/// the temp directory itself (via `tempfile::TempDir`'s own `Drop`).
pub(crate) struct ChrootWorkspace {
    _tempdir: tempfile::TempDir,
    mount_target: Utf8PathBuf,
    guard: Option<ChrootGuard>,
}

impl ChrootWorkspace {
    /// Mount the filesystem's `deployments/<name>` subvolume at a fresh
    /// temp directory and enter a [`ChrootGuard`] on it.
    pub(crate) fn prepare(device: &str, subvol_rel: &str) -> Result<Self> {
        let tempdir = tempfile::Builder::new()
            .prefix("hammer-chroot-")
            .tempdir()
            .context("creating chroot temp directory")?;
        let mount_target = Utf8PathBuf::from_path_buf(tempdir.path().to_path_buf())
            .map_err(|p| anyhow!("chroot temp directory {} is not valid UTF-8", p.display()))?;
        let out = Task::new(
            format!("Mounting {subvol_rel} at {mount_target}"),
            "mount",
        )
        .args(["-o", &format!("subvol={subvol_rel}"), device, mount_target.as_str()])
        .run()
        .map_err(|e| mount_err("mount deployment subvolume", e.to_string()))?;
        if !out.success {
            return Err(mount_err("mount deployment subvolume", out.stderr_str()).into());
        }
        let guard = match ChrootGuard::enter(&mount_target) {
            Ok(guard) => guard,
            Err(e) => {
                if let Err(ue) = umount(&mount_target) {
                    tracing::warn!(error = %ue, "failed to unmount chroot workspace after setup failure");
                }
                return Err(e);
            }
        };
        copy_resolv_conf(&mount_target);
        Ok(ChrootWorkspace {
            _tempdir: tempdir,
            mount_target,
            guard: Some(guard),
        })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.mount_target
    }
}

impl Drop for ChrootWorkspace {
    fn drop(&mut self) {
        // Dropping the guard first tears down proc/sys/dev/devpts/shm;
        // only then is it safe to unmount the subvolume they were nested
        // inside.
        self.guard.take();
        if let Err(e) = umount(&self.mount_target) {
            tracing::warn!(target = %self.mount_target, error = %e, "failed to unmount chroot workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chroot_mounts_list() {
        assert_eq!(CHROOT_MOUNTS.len(), 5);
        assert_eq!(CHROOT_MOUNTS[0], "proc");
    }

    #[test]
    fn test_parse_root_device_strips_subvol_decoration() {
        assert_eq!(
            parse_root_device("/dev/vda2[/deployments/hammer-A]\n"),
            Some("/dev/vda2".to_string())
        );
    }

    #[test]
    fn test_parse_root_device_plain() {
        assert_eq!(parse_root_device("/dev/vda2\n"), Some("/dev/vda2".to_string()));
    }

    #[test]
    fn test_parse_root_device_empty() {
        assert_eq!(parse_root_device(""), None);
    }
}
