//! Higher-level engine tests, run against a scratch directory tree standing
//! in for `/btrfs-root` rather than a real btrfs filesystem or root
//! privileges. Covers the subset of `Engine` that needs neither: boot-time
//! reconciliation, status/history reporting, and precondition checks.

use camino::Utf8Path;
use hammer_lib::config::Config;
use hammer_lib::engine::{DeploymentMeta, DeploymentStatus, Engine, ReconcileOutcome};

fn write_deployment(config: &Config, name: &str, created: &str, status: DeploymentStatus) {
    let dep = config.deployment_path(name);
    std::fs::create_dir_all(&dep).unwrap();
    let meta = DeploymentMeta {
        created: created.parse().unwrap(),
        action: "initial".into(),
        parent: String::new(),
        kernel: "6.1.0-18-amd64".into(),
        system_version: "abcd1234".into(),
        status,
        rollback_reason: None,
    };
    std::fs::write(dep.join("meta.json"), serde_json::to_string_pretty(&meta).unwrap()).unwrap();
}

fn write_marker(config: &Config, deployment: &str) {
    std::fs::write(
        config.marker_path(),
        serde_json::json!({ "deployment": deployment }).to_string(),
    )
    .unwrap();
}

#[test]
fn test_check_transaction_is_clean_on_a_fresh_system() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    let engine = Engine::new(Config::rooted_at(root));

    assert_eq!(engine.check_transaction().unwrap(), ReconcileOutcome::Clean);
}

#[test]
fn test_check_transaction_reconciles_successful_boot() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    let config = Config::rooted_at(root);

    write_deployment(&config, "hammer-20240101000000", "2024-01-01T00:00:00Z", DeploymentStatus::Ready);
    std::os::unix::fs::symlink(
        config.deployment_path("hammer-20240101000000"),
        config.current_link(),
    )
    .unwrap();
    write_marker(&config, "hammer-20240101000000");

    let engine = Engine::new(config.clone());
    let outcome = engine.check_transaction().unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Booted {
            deployment: "hammer-20240101000000".into()
        }
    );
    assert!(!config.marker_path().exists(), "marker must be removed either way");

    let (name, meta) = engine.status().unwrap();
    assert_eq!(name, "hammer-20240101000000");
    assert_eq!(meta.status, DeploymentStatus::Booted);
}

#[test]
fn test_check_transaction_reconciles_failed_boot_as_broken() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    let config = Config::rooted_at(root);

    // current still resolves to the old deployment: the pending one never
    // made it onto the bootloader menu, or the boot into it failed and the
    // bootloader fell through to the previous entry.
    write_deployment(&config, "hammer-20240101000000", "2024-01-01T00:00:00Z", DeploymentStatus::Booted);
    write_deployment(&config, "hammer-20240102000000", "2024-01-02T00:00:00Z", DeploymentStatus::Ready);
    std::os::unix::fs::symlink(
        config.deployment_path("hammer-20240101000000"),
        config.current_link(),
    )
    .unwrap();
    write_marker(&config, "hammer-20240102000000");

    let engine = Engine::new(config.clone());
    let outcome = engine.check_transaction().unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Broken {
            deployment: "hammer-20240102000000".into()
        }
    );
    assert!(!config.marker_path().exists());

    let history = engine.history().unwrap();
    let pending = history
        .iter()
        .find(|(name, _, _)| name == "hammer-20240102000000")
        .unwrap();
    assert_eq!(pending.1.status, DeploymentStatus::Broken);
    assert!(!pending.2, "a broken deployment is never the one current resolves to");
}

#[test]
fn test_history_sorts_newest_first_and_marks_current() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    let config = Config::rooted_at(root);

    write_deployment(&config, "hammer-20240101000000", "2024-01-01T00:00:00Z", DeploymentStatus::Previous);
    write_deployment(&config, "hammer-20240102000000", "2024-01-02T00:00:00Z", DeploymentStatus::Booted);
    write_deployment(&config, "hammer-20240103000000", "2024-01-03T00:00:00Z", DeploymentStatus::Ready);
    std::os::unix::fs::symlink(
        config.deployment_path("hammer-20240102000000"),
        config.current_link(),
    )
    .unwrap();

    let engine = Engine::new(config);
    let history = engine.history().unwrap();
    let names: Vec<_> = history.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "hammer-20240103000000",
            "hammer-20240102000000",
            "hammer-20240101000000",
        ]
    );
    let current_flags: Vec<_> = history.iter().map(|(_, _, c)| *c).collect();
    assert_eq!(current_flags, vec![false, true, false]);
}

#[test]
fn test_current_name_fails_cleanly_before_init() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    let engine = Engine::new(Config::rooted_at(root));

    let err = engine.status().unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}
