//! `ChrootCmd`: a small typed replacement for composing chroot work as a
//! single `sh -c "cmd1 && cmd2 && ..."` string. Each step is an argv
//! vector run directly (no shell, no quoting hazards); the first step to
//! exit non-zero stops the whole sequence.

use camino::Utf8Path;

use crate::error::{HammerError, Result};
use crate::task::Task;

enum Step {
    Argv(Vec<String>),
    Shell(String),
}

pub(crate) struct ChrootCmd<'a> {
    root: &'a Utf8Path,
    steps: Vec<Step>,
}

impl<'a> ChrootCmd<'a> {
    pub(crate) fn new(root: &'a Utf8Path) -> Self {
        Self {
            root,
            steps: Vec::new(),
        }
    }

    /// Queue one step: a program name followed by its arguments, run as
    /// `chroot <root> <argv...>`.
    pub(crate) fn step<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps
            .push(Step::Argv(argv.into_iter().map(Into::into).collect()));
        self
    }

    /// Queue one step run as `chroot <root> sh -c <command>`, for the rare
    /// pipeline that genuinely needs shell redirection (e.g. dumping
    /// `dpkg -l` to a file). Prefer [`Self::step`] everywhere else.
    pub(crate) fn shell_step(mut self, command: impl Into<String>) -> Self {
        self.steps.push(Step::Shell(command.into()));
        self
    }

    /// Run every queued step in order inside the chroot at `root`. Stops
    /// and returns `HammerError::Chroot` on the first non-zero exit.
    pub(crate) fn run(self) -> Result<()> {
        for step in &self.steps {
            let (stage, out) = match step {
                Step::Argv(argv) => {
                    let stage = argv.join(" ");
                    let description = format!("chroot {}: {stage}", self.root);
                    let out = Task::new(description, "chroot")
                        .args(
                            std::iter::once(self.root.as_str().to_string())
                                .chain(argv.iter().cloned()),
                        )
                        .run()
                        .map_err(HammerError::Other)?;
                    (stage, out)
                }
                Step::Shell(command) => {
                    let description = format!("chroot {}: sh -c {command}", self.root);
                    let out = Task::new(description, "chroot")
                        .args([self.root.as_str(), "sh", "-c", command])
                        .run()
                        .map_err(HammerError::Other)?;
                    (command.clone(), out)
                }
            };
            if !out.success {
                return Err(HammerError::Chroot {
                    stage,
                    stderr: out.stderr_str(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_steps() {
        let cmd = ChrootCmd::new(Utf8Path::new("/tmp/x"))
            .step(["apt-get", "update"])
            .shell_step("dpkg -l > /tmp/packages.list")
            .step(["apt-get", "-y", "autoremove"]);
        assert_eq!(cmd.steps.len(), 3);
        assert!(matches!(&cmd.steps[0], Step::Argv(argv) if argv == &vec!["apt-get".to_string(), "update".to_string()]));
        assert!(matches!(&cmd.steps[1], Step::Shell(s) if s == "dpkg -l > /tmp/packages.list"));
    }

    #[test]
    fn test_run_with_real_root_fails_without_chroot_privilege() {
        // No root privilege in the test environment; chroot(2) itself
        // will refuse, which still exercises the non-zero-exit path.
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let err = ChrootCmd::new(root).step(["true"]).run().unwrap_err();
        assert!(matches!(err, HammerError::Chroot { .. }));
    }
}
