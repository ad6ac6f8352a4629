//! A single explicit configuration value threaded through the engine,
//! in place of scattered ambient path/constant globals.

use camino::{Utf8Path, Utf8PathBuf};

/// Prefix every deployment subvolume name carries.
pub const DEPLOYMENT_PREFIX: &str = "hammer-";

/// Number of "good" (ready/booted) deployments kept in the boot menu and
/// retained by `clean`.
pub const RETAINED_DEPLOYMENTS: usize = 5;

/// Every path and limit the engine needs to operate, gathered in one place
/// instead of scattered string literals. Constructed once via
/// [`Config::default`] for production use; tests build their own pointing
/// at a scratch directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Top-level btrfs mount, e.g. `/btrfs-root`.
    pub btrfs_root: Utf8PathBuf,
    /// Lock file path, e.g. `/run/hammer.lock`.
    pub lock_path: Utf8PathBuf,
    /// Optional append-only log file.
    pub log_path: Utf8PathBuf,
    /// Maximum number of `ready`/`booted` deployments surfaced in the boot
    /// menu and retained by `clean`.
    pub retained_deployments: usize,
}

impl Config {
    /// The deployments directory, `<btrfs_root>/deployments`.
    pub fn deployments_dir(&self) -> Utf8PathBuf {
        self.btrfs_root.join("deployments")
    }

    /// The `current` symlink path, `<btrfs_root>/current`.
    pub fn current_link(&self) -> Utf8PathBuf {
        self.btrfs_root.join("current")
    }

    /// The transaction marker path, `<btrfs_root>/hammer-transaction`.
    pub fn marker_path(&self) -> Utf8PathBuf {
        self.btrfs_root.join("hammer-transaction")
    }

    /// Absolute path of a named deployment under `deployments/`.
    pub fn deployment_path(&self, name: &str) -> Utf8PathBuf {
        self.deployments_dir().join(name)
    }

    /// Build a `Config` rooted at an arbitrary directory, e.g. a tempdir in
    /// tests. The lock and log paths are placed inside `root` as well so
    /// that a whole test fixture can be torn down by deleting one directory.
    pub fn rooted_at(root: impl AsRef<Utf8Path>) -> Self {
        let root = root.as_ref();
        Self {
            btrfs_root: root.to_owned(),
            lock_path: root.join("hammer.lock"),
            log_path: root.join("hammer-updater.log"),
            retained_deployments: RETAINED_DEPLOYMENTS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            btrfs_root: "/btrfs-root".into(),
            lock_path: "/run/hammer.lock".into(),
            log_path: "/usr/lib/HackerOS/hammer/logs/hammer-updater.log".into(),
            retained_deployments: RETAINED_DEPLOYMENTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let cfg = Config::rooted_at("/tmp/x");
        assert_eq!(cfg.deployments_dir().as_str(), "/tmp/x/deployments");
        assert_eq!(cfg.current_link().as_str(), "/tmp/x/current");
        assert_eq!(cfg.marker_path().as_str(), "/tmp/x/hammer-transaction");
        assert_eq!(
            cfg.deployment_path("hammer-20240101000000").as_str(),
            "/tmp/x/deployments/hammer-20240101000000"
        );
    }

    #[test]
    fn test_default_matches_spec_paths() {
        let cfg = Config::default();
        assert_eq!(cfg.btrfs_root.as_str(), "/btrfs-root");
        assert_eq!(cfg.lock_path.as_str(), "/run/hammer.lock");
    }
}
