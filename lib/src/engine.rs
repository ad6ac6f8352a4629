//! `DeploymentEngine`: orchestrates `init`/`update`/`install`/`remove`/
//! `deploy`/`switch`/`rollback`/`refresh`/`clean`/`status`/`history`/
//! `check-transaction`, composing every other module in this crate.
//!
//! Every mutating operation takes the lock, validates the running
//! environment, snapshots a new deployment, writes the transaction marker,
//! performs its chroot work, verifies the result, writes metadata, seals the
//! deployment read-only, and flips the default subvolume and `current`
//! symlink. The marker is deliberately **not** removed here: removal only
//! happens at the next boot's [`Engine::check_transaction`], which is the
//! only place that can distinguish "this deployment really did become the
//! booted root" from "the host died before the bootloader ever tried it".

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use libsystemd::logging::Priority;

use crate::chroot_cmd::ChrootCmd;
use crate::config::Config;
use crate::error::{HammerError, Result};
use crate::lock::LockGuard;
use crate::metadata;
use crate::mount::{self, ChrootWorkspace};
use crate::task::Task;
use crate::{bootentries, btrfs, journal, kernel, sysversion, transaction};

pub use crate::metadata::{DeploymentMeta, DeploymentStatus};

/// What `update` actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The system had no `current` symlink yet, so `init` ran instead.
    /// The operator should reboot and rerun `update`.
    Initialized {
        /// Name of the deployment `init` created.
        deployment: String,
    },
    /// A new deployment was created, upgraded, and promoted.
    Updated {
        /// Name of the new deployment.
        deployment: String,
    },
}

/// What `check_transaction` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No transaction marker was present; nothing to reconcile.
    Clean,
    /// `current` already resolved to the marked deployment; it was promoted
    /// to `booted`.
    Booted {
        /// Name of the deployment that was promoted.
        deployment: String,
    },
    /// `current` did not resolve to the marked deployment (the host never
    /// booted it, or booted something else); it was marked `broken`.
    Broken {
        /// Name of the deployment that was marked broken.
        deployment: String,
    },
}

/// One entry of `history`: a deployment's name, its metadata, and whether it
/// is the deployment `current` presently points at.
pub type HistoryEntry = (String, DeploymentMeta, bool);

/// The engine: every path it needs lives in `config`; no other state.
#[derive(Debug)]
pub struct Engine {
    config: Config,
}

impl Engine {
    /// Build an engine operating against `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The configuration this engine operates against.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Name of the deployment `current` resolves to.
    pub fn current_name(&self) -> Result<String> {
        let link = self.config.current_link();
        let target = std::fs::read_link(&link).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HammerError::Env(format!("{link} does not exist; run `hammer init` first"))
            } else {
                HammerError::Other(e.into())
            }
        })?;
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| HammerError::Env(format!("{link} target has no valid name")))?;
        Ok(name.to_string())
    }

    /// The filesystem at `config.btrfs_root` must be btrfs; `current` must
    /// exist; its target must be read-only. Every mutating operation except
    /// `init` calls this before touching anything.
    pub fn validate(&self) -> Result<()> {
        let fs = mount::inspect_filesystem(&self.config.btrfs_root).map_err(HammerError::Other)?;
        if fs.fstype != "btrfs" {
            return Err(HammerError::Env(format!(
                "{} is not a btrfs filesystem (found {})",
                self.config.btrfs_root, fs.fstype
            )));
        }
        let current = self.current_name()?;
        let target = self.config.deployment_path(&current);
        if !btrfs::is_ro(&target)? {
            return Err(HammerError::Env(format!(
                "current deployment {current} is not read-only"
            )));
        }
        Ok(())
    }

    /// First-time provisioning: snapshot the running root (not an existing
    /// deployment) into `deployments/`, run the initial package-tool
    /// sequence, and promote it. Preconditions: no `current` symlink yet.
    pub fn init(&self) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        let current = self.config.current_link();
        if current.exists() || current.is_symlink() {
            return Err(HammerError::Env(
                "already initialized (current symlink exists)".into(),
            ));
        }
        std::fs::create_dir_all(self.config.deployments_dir())?;
        let running_rel = btrfs::subvol_name(Utf8Path::new("/"))?;
        let source_path = if running_rel.is_empty() {
            self.config.btrfs_root.clone()
        } else {
            self.config.btrfs_root.join(&running_rel)
        };
        let dest = self.mutate("initial", "", &source_path, |root| {
            ChrootCmd::new(root)
                .step(["apt-get", "update"])
                .step(["apt-get", "install", "-y", "--reinstall", "plymouth"])
                .step(["apt-mark", "manual", "plymouth"])
                .shell_step("dpkg -l > /tmp/packages.list")
                .step(["update-initramfs", "-u", "-k", "all"])
                .shell_step("chmod -x /etc/grub.d/[0-9]* 2>/dev/null || true")
                .run()
        })?;
        Ok(deployment_name(&dest))
    }

    /// Upgrade the current deployment's successor. Delegates to `init` when
    /// the system has never been initialized.
    pub fn update(&self) -> Result<UpdateOutcome> {
        if !self.config.current_link().exists() {
            let deployment = self.init()?;
            return Ok(UpdateOutcome::Initialized { deployment });
        }
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let parent = self.current_name()?;
        let source = self.config.deployment_path(&parent);
        let dest = self.mutate("update", &parent, &source, |root| {
            ChrootCmd::new(root)
                .step(["apt-get", "update"])
                .step([
                    "apt-get",
                    "-y",
                    "-o",
                    "Dpkg::Options::=--force-confdef",
                    "-o",
                    "Dpkg::Options::=--force-confold",
                    "dist-upgrade",
                ])
                .step(["apt-get", "-y", "autoremove"])
                .shell_step("dpkg -l > /tmp/packages.list")
                .step(["update-initramfs", "-u", "-k", "all"])
                .shell_step("chmod -x /etc/grub.d/[0-9]* 2>/dev/null || true")
                .run()
        })?;
        Ok(UpdateOutcome::Updated {
            deployment: deployment_name(&dest),
        })
    }

    /// Install `package` into a new deployment. Fails with
    /// `HammerError::Noop` (still leaving a `broken` half-built deployment
    /// behind) if `package` is already installed.
    pub fn install(&self, package: &str) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let parent = self.current_name()?;
        let source = self.config.deployment_path(&parent);
        let pkg = package.to_string();
        let dest = self.mutate(format!("install {package}"), &parent, &source, move |root| {
            if package_installed(root, &pkg).map_err(HammerError::Other)? {
                return Err(HammerError::Noop(pkg.clone()));
            }
            ChrootCmd::new(root)
                .step(["apt-get", "update"])
                .step(["apt-get", "install", "-y", &pkg])
                .step(["apt-get", "-y", "autoremove"])
                .shell_step("dpkg -l > /tmp/packages.list")
                .step(["update-initramfs", "-u", "-k", "all"])
                .run()
        })?;
        Ok(deployment_name(&dest))
    }

    /// Remove `package` from a new deployment. Fails with
    /// `HammerError::Noop` if `package` is already absent.
    pub fn remove(&self, package: &str) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let parent = self.current_name()?;
        let source = self.config.deployment_path(&parent);
        let pkg = package.to_string();
        let dest = self.mutate(format!("remove {package}"), &parent, &source, move |root| {
            if !package_installed(root, &pkg).map_err(HammerError::Other)? {
                return Err(HammerError::Noop(pkg.clone()));
            }
            ChrootCmd::new(root)
                .step(["apt-get", "remove", "-y", &pkg])
                .step(["apt-get", "-y", "autoremove"])
                .shell_step("dpkg -l > /tmp/packages.list")
                .step(["update-initramfs", "-u", "-k", "all"])
                .run()
        })?;
        Ok(deployment_name(&dest))
    }

    /// Create a new deployment identical to the current one, with no
    /// package action, to force a new identity for the current content.
    pub fn deploy(&self) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let parent = self.current_name()?;
        let source = self.config.deployment_path(&parent);
        let dest = self.mutate("deploy", &parent, &source, |root| {
            ChrootCmd::new(root).shell_step("dpkg -l > /tmp/packages.list").run()
        })?;
        Ok(deployment_name(&dest))
    }

    /// Switch `current` to `name`, or to the second-newest deployment by
    /// `created` if `name` is absent.
    pub fn switch(&self, name: Option<&str>) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let target_name = match name {
            Some(n) => n.to_string(),
            None => {
                let all = metadata::all_with_meta_newest_first(&self.config.deployments_dir())?;
                if all.len() < 2 {
                    return Err(HammerError::NotFound("no previous deployment to switch to".into()));
                }
                all[1].0.clone()
            }
        };
        self.promote(&target_name)?;
        Ok(target_name)
    }

    /// Roll back `n` deployments: sort by `created` descending and target
    /// index `n` (so `rollback(1)` is the same target `switch()` with no
    /// argument picks).
    pub fn rollback(&self, n: usize) -> Result<String> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let all = metadata::all_with_meta_newest_first(&self.config.deployments_dir())?;
        if n >= all.len() {
            return Err(HammerError::NotFound(format!(
                "rollback index {n} (only {} deployments)",
                all.len()
            )));
        }
        let target_name = all[n].0.clone();
        self.promote(&target_name)?;
        Ok(target_name)
    }

    /// Refresh the current deployment's package-tool metadata cache
    /// in-place. No snapshot, metadata write, or transaction marker is
    /// involved: `refresh` does not participate in the deployment lifecycle.
    pub fn refresh(&self) -> Result<()> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        self.validate()?;
        let current = self.current_name()?;
        mount::ensure_top_mounted(&self.config.btrfs_root)?;
        let device = mount::resolve_root_device()?;
        let subvol_rel = format!("deployments/{current}");
        let workspace = ChrootWorkspace::prepare(&device, &subvol_rel).map_err(HammerError::Other)?;
        ChrootCmd::new(workspace.root()).step(["apt-get", "update"]).run()?;
        Ok(())
    }

    /// Prune unused containers (best-effort, only if the sandbox's
    /// container tool is present) then delete deployments down to
    /// `config.retained_deployments`, always keeping `current` regardless of
    /// its age.
    pub fn clean(&self) -> Result<Vec<String>> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;
        match Task::new("Pruning unused containers", "podman")
            .args(["system", "prune", "-f"])
            .run()
        {
            Ok(out) if !out.success => {
                tracing::debug!(stderr = %out.stderr_str(), "podman prune reported failure, ignoring");
            }
            Err(e) => {
                tracing::debug!(error = %e, "podman not available, skipping container prune");
            }
            Ok(_) => {}
        }

        let all = metadata::all_with_meta_newest_first(&self.config.deployments_dir())?;
        let current = self.current_name().ok();
        // `current` is kept unconditionally, even if a prior `rollback`/`switch`
        // made it older than the newest few others; the remaining budget goes
        // to the newest non-current deployments, so the survivor count never
        // exceeds `retained_deployments`.
        let other_budget = self
            .config
            .retained_deployments
            .saturating_sub(if current.is_some() { 1 } else { 0 });
        let mut kept_others = 0usize;
        let mut removed = Vec::new();
        for (name, _) in &all {
            if current.as_deref() == Some(name.as_str()) {
                continue;
            }
            if kept_others < other_budget {
                kept_others += 1;
                continue;
            }
            btrfs::delete(&self.config.deployment_path(name))?;
            removed.push(name.clone());
        }
        Ok(removed)
    }

    /// The current deployment's name and metadata.
    pub fn status(&self) -> Result<(String, DeploymentMeta)> {
        let name = self.current_name()?;
        let meta = metadata::read_typed(&self.config.deployment_path(&name))?;
        Ok((name, meta))
    }

    /// Every deployment, newest first, each paired with whether it is the
    /// one `current` resolves to.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let all = metadata::all_with_meta_newest_first(&self.config.deployments_dir())?;
        let current = self.current_name().ok();
        Ok(all
            .into_iter()
            .map(|(name, meta)| {
                let is_current = current.as_deref() == Some(name.as_str());
                (name, meta, is_current)
            })
            .collect())
    }

    /// Boot-time reconciliation: if a transaction marker is present,
    /// promote the marked deployment to `booted` if `current` agrees with
    /// it, or mark it `broken` otherwise. Removes the marker either way.
    /// Does not take the lock: this is meant to run once, early at boot,
    /// before anything else could contend for it.
    pub fn check_transaction(&self) -> Result<ReconcileOutcome> {
        let marker_path = self.config.marker_path();
        let Some(marker) = transaction::read(&marker_path)? else {
            return Ok(ReconcileOutcome::Clean);
        };
        let current = self.current_name().ok();
        let target = self.config.deployment_path(&marker.deployment);
        let outcome = if current.as_deref() == Some(marker.deployment.as_str()) {
            metadata::set_status(&target, DeploymentStatus::Booted, None)?;
            journal::journal_print(
                Priority::Info,
                &format!("hammer: reconciled {} as booted", marker.deployment),
            );
            ReconcileOutcome::Booted {
                deployment: marker.deployment,
            }
        } else {
            metadata::set_status(&target, DeploymentStatus::Broken, None)?;
            journal::journal_print(
                Priority::Warning,
                &format!("hammer: reconciled {} as broken", marker.deployment),
            );
            ReconcileOutcome::Broken {
                deployment: marker.deployment,
            }
        };
        transaction::remove(&marker_path)?;
        Ok(outcome)
    }

    /// Shared scaffold for every operation that creates a new deployment:
    /// snapshot, mark the transaction in flight, run `chroot_work`, and
    /// either seal and promote it or mark it `broken`. The marker is left
    /// in place either way; only `check_transaction` removes it.
    fn mutate(
        &self,
        action: impl Into<String>,
        parent: &str,
        source_path: &Utf8Path,
        chroot_work: impl FnOnce(&Utf8Path) -> Result<()>,
    ) -> Result<Utf8PathBuf> {
        let action = action.into();
        let new_name = new_deployment_name();
        let dest = self.config.deployment_path(&new_name);
        std::fs::create_dir_all(self.config.deployments_dir())?;
        btrfs::snapshot_recursive(source_path, &dest, true)?;
        transaction::create(&self.config.marker_path(), &new_name)?;

        match self.finish_transaction(&action, parent, &new_name, &dest, chroot_work) {
            Ok(()) => {
                journal::journal_print(
                    Priority::Info,
                    &format!("hammer: {action} sealed {new_name} ready"),
                );
                Ok(dest)
            }
            Err(e) => {
                let meta = DeploymentMeta {
                    created: Utc::now(),
                    action,
                    parent: parent.to_string(),
                    kernel: String::new(),
                    system_version: String::new(),
                    status: DeploymentStatus::Broken,
                    rollback_reason: None,
                };
                if let Err(we) = metadata::write(&dest, &meta) {
                    tracing::warn!(error = %we, deployment = %new_name, "failed to record broken status");
                }
                journal::journal_print(
                    Priority::Err,
                    &format!("hammer: {new_name} marked broken: {e}"),
                );
                Err(e)
            }
        }
    }

    /// The part of [`Self::mutate`] that can fail: chroot work, sanity
    /// check, metadata write, boot entries, sealing, and promotion, in the
    /// order the engine guarantees.
    fn finish_transaction(
        &self,
        action: &str,
        parent: &str,
        new_name: &str,
        dest: &Utf8Path,
        chroot_work: impl FnOnce(&Utf8Path) -> Result<()>,
    ) -> Result<()> {
        mount::ensure_top_mounted(&self.config.btrfs_root)?;
        let device = mount::resolve_root_device()?;
        let subvol_rel = format!("deployments/{new_name}");
        let workspace =
            ChrootWorkspace::prepare(&device, &subvol_rel).map_err(HammerError::Other)?;
        chroot_work(workspace.root())?;

        let packages_list_path = dest.join("tmp/packages.list");
        let packages_list = std::fs::read_to_string(&packages_list_path)
            .map_err(|_| HammerError::Sanity(format!("{packages_list_path} is missing")))?;
        let kernel = kernel::highest_kernel_version(&packages_list)
            .ok_or_else(|| HammerError::Sanity(format!("no linux-image package found in {packages_list_path}")))?;
        if !kernel::boot_files_exist(dest, &kernel) {
            return Err(HammerError::Sanity(format!(
                "boot files for kernel {kernel} missing in {dest}"
            )));
        }
        let fstab_check = Task::new(format!("Dry-run mount check in {}", workspace.root()), "chroot")
            .args([workspace.root().as_str(), "mount", "-f", "-a"])
            .run()
            .map_err(|e| HammerError::Mount {
                stage: "fstab dry-run mount".to_string(),
                stderr: e.to_string(),
            })?;
        if !fstab_check.success {
            return Err(HammerError::Sanity(format!(
                "fstab dry-run mount failed: {}",
                fstab_check.stderr_str()
            )));
        }

        let system_version = sysversion::compute_and_remove(dest)?;
        let meta = DeploymentMeta {
            created: Utc::now(),
            action: action.to_string(),
            parent: parent.to_string(),
            kernel,
            system_version,
            status: DeploymentStatus::Ready,
            rollback_reason: None,
        };
        metadata::write(dest, &meta)?;

        let fs_uuid = btrfs::fs_uuid()?;
        bootentries::write_entries(&self.config, dest, &fs_uuid)?;
        ChrootCmd::new(workspace.root()).step(["update-grub"]).run()?;

        drop(workspace);

        btrfs::set_ro_recursive(dest, true)?;
        let id = btrfs::subvol_id(dest)?;
        btrfs::set_default(id)?;
        self.repoint_current(dest)?;
        Ok(())
    }

    /// Resolve `target_name`'s subvolume id, flip the default subvolume,
    /// repoint `current`, demote whatever `current` pointed to before (if
    /// different), and drop a transaction marker naming the target so
    /// reconciliation can confirm the promotion at next boot.
    fn promote(&self, target_name: &str) -> Result<()> {
        let target_path = self.config.deployment_path(target_name);
        if !target_path.is_dir() {
            return Err(HammerError::NotFound(format!("deployment {target_name}")));
        }
        let target_meta = metadata::read_typed(&target_path)?;
        if target_meta.status == DeploymentStatus::Broken {
            return Err(HammerError::Env(format!(
                "cannot switch to broken deployment {target_name}"
            )));
        }
        let previous_name = self.current_name().ok();
        let id = btrfs::subvol_id(&target_path)?;
        btrfs::set_default(id)?;
        self.repoint_current(&target_path)?;
        if let Some(previous_name) = previous_name {
            if previous_name != target_name {
                metadata::set_status(
                    &self.config.deployment_path(&previous_name),
                    DeploymentStatus::Previous,
                    Some("manual"),
                )?;
            }
        }
        transaction::create(&self.config.marker_path(), target_name)?;
        journal::journal_print(Priority::Info, &format!("hammer: promoted {target_name}"));
        Ok(())
    }

    fn repoint_current(&self, target: &Utf8Path) -> Result<()> {
        let current = self.config.current_link();
        if current.exists() || current.is_symlink() {
            std::fs::remove_file(&current)?;
        }
        std::os::unix::fs::symlink(target, &current)?;
        Ok(())
    }
}

fn new_deployment_name() -> String {
    format!(
        "{}{}",
        crate::config::DEPLOYMENT_PREFIX,
        chrono::Local::now().format("%Y%m%d%H%M%S")
    )
}

fn deployment_name(path: &Utf8Path) -> String {
    path.file_name()
        .expect("deployment path always has a final component")
        .to_string()
}

/// `chroot <root> dpkg-query -W -f='${Status}' <package>`; true iff dpkg
/// reports the package installed.
fn package_installed(root: &Utf8Path, package: &str) -> anyhow::Result<bool> {
    let out = Task::new(format!("Checking dpkg status of {package}"), "chroot")
        .args([root.as_str(), "dpkg-query", "-W", "-f=${Status}", package])
        .run()?;
    Ok(out.success && out.stdout_str().contains("install ok installed"))
}
