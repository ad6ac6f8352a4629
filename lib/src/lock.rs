//! Single-writer, non-blocking, file-existence based locking.
//!
//! Deliberately not PID-aware: a stale lock left behind by a killed process
//! must be removed by an operator (or by `clean`'s deployment-list
//! reconciliation noticing the marker's age), not silently reclaimed. This
//! mirrors the lock file's role as the one thing standing between two
//! concurrent `hammer` invocations.

use camino::Utf8PathBuf;

use crate::error::{HammerError, Result};

/// Holds the lock file for its lifetime; removes it on drop.
pub(crate) struct LockGuard {
    path: Utf8PathBuf,
}

impl LockGuard {
    /// Attempt to acquire the lock at `path`, failing immediately (rather
    /// than blocking) if it's already held.
    ///
    /// `#[fn_error_context::context]` is deliberately not used here: it
    /// expands to a `.map_err(|err| err.context(...))` call that requires
    /// an inherent `.context()` method, which only `anyhow::Error`
    /// provides, not `HammerError`. The "acquiring lock" description is
    /// folded into the `Other` branch's error by hand instead.
    pub(crate) fn acquire(path: &camino::Utf8Path) -> Result<Self> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(LockGuard {
                path: path.to_owned(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(HammerError::Busy),
            Err(e) => Err(HammerError::Other(
                anyhow::Error::new(e).context(format!("acquiring lock {path}")),
            )),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path, error = %e, "failed to remove lock file");
        }
    }
}
