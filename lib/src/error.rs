//! The typed error surface for the engine.
//!
//! Every fallible engine entry point returns `Result<T, HammerError>`.
//! Internal helpers are free to use `anyhow::Result` and surface into a
//! `HammerError` at the boundary via `?` and the `Other` variant.

use thiserror::Error;

/// Every error kind the engine can produce, corresponding 1:1 to the
/// abstract kinds in the design document.
#[derive(Debug, Error)]
pub enum HammerError {
    /// The lock file was already present; another operation is in progress.
    #[error("another hammer operation is already in progress")]
    Busy,

    /// A precondition about the running environment did not hold: root
    /// filesystem not btrfs, no `current` symlink, running deployment not
    /// read-only, or missing root privilege.
    #[error("{0}")]
    Env(String),

    /// A `btrfs` admin CLI invocation failed.
    #[error("btrfs {stage} failed: {stderr}")]
    Btrfs {
        /// Which btrfs operation was being attempted (snapshot, set-default, ...).
        stage: String,
        /// Captured stderr from the failed invocation.
        stderr: String,
    },

    /// A `mount`/`umount` invocation failed.
    #[error("mount {stage} failed: {stderr}")]
    Mount {
        /// Which mount operation was being attempted.
        stage: String,
        /// Captured stderr from the failed invocation.
        stderr: String,
    },

    /// A command run inside the chroot exited non-zero.
    #[error("chroot command failed ({stage}): {stderr}")]
    Chroot {
        /// Which chroot step failed.
        stage: String,
        /// Captured stderr from the failed invocation.
        stderr: String,
    },

    /// The pre-seal sanity check failed.
    #[error("sanity check failed: {0}")]
    Sanity(String),

    /// `meta.json` was missing or malformed in a context that required it.
    #[error("deployment metadata error: {0}")]
    Meta(String),

    /// A requested deployment, rollback index, or package was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// `install`/`remove` found the package already in the desired state.
    #[error("no change: {0} already in desired state")]
    Noop(String),

    /// Escape hatch for I/O and (de)serialization errors that don't need a
    /// dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for HammerError {
    fn from(e: std::io::Error) -> Self {
        HammerError::Other(e.into())
    }
}

impl From<serde_json::Error> for HammerError {
    fn from(e: serde_json::Error) -> Self {
        HammerError::Meta(e.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, HammerError>;
