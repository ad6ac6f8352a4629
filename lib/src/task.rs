//! `ProcessRunner`: a small builder over [`std::process::Command`] that
//! captures exit status, stdout and stderr. Per the component contract,
//! `Task::run` never raises on a non-zero exit; it is up to the caller to
//! turn a failed [`TaskOutput`] into a typed [`crate::error::HammerError`].
//! [`Task::run_checked`]/[`Task::read`] are the convenience wrappers most
//! call sites actually want.

use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

/// The fully captured result of running a child process to completion.
#[derive(Debug, Clone)]
pub(crate) struct TaskOutput {
    pub(crate) success: bool,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl TaskOutput {
    fn from_std(o: Output) -> Self {
        Self {
            success: o.status.success(),
            stdout: o.stdout,
            stderr: o.stderr,
        }
    }

    /// Stdout decoded as UTF-8 (lossily), trimmed of trailing whitespace.
    pub(crate) fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim_end().to_string()
    }

    /// Stderr decoded as UTF-8 (lossily), trimmed of trailing whitespace.
    pub(crate) fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_string()
    }
}

/// A single external-tool invocation: a program, its arguments, and a
/// human-readable description used for `tracing` progress output.
///
/// Standard input is never connected by default; there is no shell
/// interposition unless the caller explicitly builds a [`Task::shell`].
pub(crate) struct Task {
    description: String,
    cmd: Command,
}

impl Task {
    /// Build a task invoking `exe` directly (no shell).
    pub(crate) fn new(description: impl Into<String>, exe: impl AsRef<OsStr>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        Self {
            description: description.into(),
            cmd,
        }
    }

    /// Build a task that runs `command` through `sh -c`. This is the only
    /// sanctioned shell-interposition path (`run_shell` in the component
    /// contract); it exists for the handful of chroot pipelines that
    /// genuinely need shell features. Every other call site uses
    /// [`Task::new`] plus [`Task::args`] to avoid quoting hazards.
    pub(crate) fn shell(description: impl Into<String>, command: impl AsRef<OsStr>) -> Self {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        Self {
            description: description.into(),
            cmd,
        }
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Set the current working directory for the child process.
    pub(crate) fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Run the task to completion, capturing stdout and stderr. Never
    /// fails merely because the child exited non-zero.
    pub(crate) fn run(self) -> Result<TaskOutput> {
        let Task {
            description,
            mut cmd,
        } = self;
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        tracing::debug!(%description, ?cmd, "exec");
        let output = cmd
            .output()
            .with_context(|| format!("Spawning {description} failed"))?;
        Ok(TaskOutput::from_std(output))
    }

    /// Run the task, returning an error if the exit status was non-zero.
    pub(crate) fn run_checked(self) -> Result<TaskOutput> {
        let description = self.description.clone();
        let out = self.run()?;
        if !out.success {
            anyhow::bail!(
                "{description} failed: {}",
                out.stderr_str().lines().next().unwrap_or("(no output)")
            );
        }
        Ok(out)
    }

    /// Run the task and return its stdout as a `String`, failing on
    /// non-zero exit.
    pub(crate) fn read(self) -> Result<String> {
        Ok(self.run_checked()?.stdout_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_checked_success() {
        let out = Task::new("true", "true").run_checked().unwrap();
        assert!(out.success);
    }

    #[test]
    fn test_run_checked_failure() {
        let err = Task::new("false", "false").run_checked().unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }

    #[test]
    fn test_read_stdout() {
        let out = Task::new("echo", "echo").args(["hello"]).read().unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_shell() {
        let out = Task::shell("shell echo", "echo a && echo b")
            .read()
            .unwrap();
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn test_run_never_raises_on_nonzero() {
        let out = Task::new("false", "false").run().unwrap();
        assert!(!out.success);
    }
}
