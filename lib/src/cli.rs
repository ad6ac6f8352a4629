//! # hammer CLI
//!
//! Command line tool to manage transactional btrfs deployments.

use std::ffi::OsString;

use anyhow::{Context, Result};
use clap::Parser;
use fn_error_context::context;

use crate::config::Config;
use crate::engine::{Engine, ReconcileOutcome, UpdateOutcome};
use crate::error::HammerError;

/// Options for `hammer install`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Name of the package to install.
    pub(crate) package: String,
}

/// Options for `hammer remove`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RemoveOpts {
    /// Name of the package to remove.
    pub(crate) package: String,
}

/// Options for `hammer switch`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct SwitchOpts {
    /// Deployment to switch to. Defaults to the one before the current
    /// deployment, sorted by creation time.
    pub(crate) name: Option<String>,
}

/// Options for `hammer rollback`.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RollbackOpts {
    /// Number of deployments to roll back, where `1` means "the one before
    /// current".
    #[clap(default_value_t = 1)]
    pub(crate) n: usize,
}

/// Transactional btrfs deployment manager.
///
/// Every mutating subcommand snapshots the current deployment, performs its
/// work inside a chroot, verifies the result, and only then flips the
/// default subvolume and `current` symlink — the booted root is never
/// edited in place.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "hammer")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Take ownership of the running root filesystem as the first
    /// deployment.
    Init,
    /// Upgrade to a fresh deployment. Runs `init` instead if the system has
    /// never been initialized.
    Update,
    /// Install a package into a new deployment.
    Install(InstallOpts),
    /// Remove a package in a new deployment.
    Remove(RemoveOpts),
    /// Create a new deployment identical to the current one, with no
    /// package change.
    Deploy,
    /// Point `current` at a different deployment.
    Switch(SwitchOpts),
    /// Roll back to an earlier deployment.
    Rollback(RollbackOpts),
    /// Refresh the current deployment's package-tool cache in place.
    Refresh,
    /// Delete deployments beyond the retention limit.
    Clean,
    /// Show the current deployment.
    Status,
    /// List every deployment, newest first.
    History,
    /// Boot-time reconciliation of a pending transaction. Safe to run even
    /// when no transaction is pending.
    #[clap(name = "check-transaction")]
    CheckTransaction,
}

impl Opt {
    /// Every subcommand but these three mutates the running system and
    /// requires full root privilege.
    fn requires_root(&self) -> bool {
        !matches!(self, Opt::Status | Opt::History | Opt::CheckTransaction)
    }
}

#[context("Requiring root privilege")]
fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    tracing::trace!("Verified uid 0 with CAP_SYS_ADMIN");
    Ok(())
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let config = Config::default();
    let _logging_guard = crate::utils::init_logging(&config);

    if opt.requires_root() {
        require_root()?;
    }

    let engine = Engine::new(config);
    match opt {
        Opt::Init => {
            let name = engine.init()?;
            println!("Initialized deployment {name}");
        }
        Opt::Update => match engine.update()? {
            UpdateOutcome::Initialized { deployment } => {
                println!("Initialized deployment {deployment}; reboot and run `hammer update` again");
            }
            UpdateOutcome::Updated { deployment } => {
                println!("Updated to deployment {deployment}");
            }
        },
        Opt::Install(opts) => match engine.install(&opts.package) {
            Ok(name) => println!("Installed {} into deployment {name}", opts.package),
            Err(HammerError::Noop(pkg)) => println!("{pkg} is already installed; no change made"),
            Err(e) => return Err(e).context("install"),
        },
        Opt::Remove(opts) => match engine.remove(&opts.package) {
            Ok(name) => println!("Removed {} in deployment {name}", opts.package),
            Err(HammerError::Noop(pkg)) => println!("{pkg} is already absent; no change made"),
            Err(e) => return Err(e).context("remove"),
        },
        Opt::Deploy => {
            let name = engine.deploy()?;
            println!("Created deployment {name}");
        }
        Opt::Switch(opts) => {
            let target = engine.switch(opts.name.as_deref())?;
            println!("Switched to deployment {target}");
        }
        Opt::Rollback(opts) => {
            let target = engine.rollback(opts.n)?;
            println!("Rolled back to deployment {target}");
        }
        Opt::Refresh => {
            engine.refresh()?;
            println!("Refreshed current deployment");
        }
        Opt::Clean => {
            let removed = engine.clean()?;
            if removed.is_empty() {
                println!("Nothing to clean");
            } else {
                for name in removed {
                    println!("Removed deployment {name}");
                }
            }
        }
        Opt::Status => {
            let (name, meta) = engine.status()?;
            print!("{}", crate::status::render_status(&name, &meta));
        }
        Opt::History => {
            let entries = engine.history()?;
            print!("{}", crate::status::render_history(&entries));
        }
        Opt::CheckTransaction => match engine.check_transaction()? {
            ReconcileOutcome::Clean => println!("No pending transaction"),
            ReconcileOutcome::Booted { deployment } => println!("Reconciled {deployment} as booted"),
            ReconcileOutcome::Broken { deployment } => println!("Reconciled {deployment} as broken"),
        },
    }
    Ok(())
}
