//! Boot menu generation: a single `grub.d` drop-in script listing the
//! newest "good" deployments, written into the deployment being sealed so
//! the in-chroot bootloader-config generator picks it up.

use std::os::unix::fs::PermissionsExt;

use camino::Utf8Path;

use crate::config::Config;
use crate::error::Result;
use crate::metadata::DeploymentMeta;

/// Relative path of the drop-in script inside a deployment.
pub(crate) const DROPIN_PATH: &str = "etc/grub.d/25_hammer_entries";

fn render_entry(name: &str, kernel: &str, fs_uuid: &str) -> String {
    format!(
        "menuentry 'hammer: {name}' {{\n\
         \tsearch --no-floppy --fs-uuid --set=root {fs_uuid}\n\
         \tlinux /deployments/{name}/boot/vmlinuz-{kernel} root=UUID={fs_uuid} rw rootflags=subvol=deployments/{name} quiet splash $vt_handoff\n\
         \tinitrd /deployments/{name}/boot/initrd.img-{kernel}\n\
         }}\n"
    )
}

/// Render the full drop-in script body: a two-line shebang header that
/// re-emits its own tail (the idiom every `/etc/grub.d/*` custom script
/// uses so `grub-mkconfig` can treat the script's stdout as literal grub
/// configuration), followed by one menu entry per deployment. Deployments
/// with no recorded kernel are skipped rather than emitting a broken
/// entry.
pub(crate) fn render(deployments: &[(String, DeploymentMeta)], fs_uuid: &str) -> String {
    let mut out = String::from("#!/bin/sh\nexec tail -n +3 \"$0\"\n");
    for (name, meta) in deployments {
        if meta.kernel.is_empty() {
            continue;
        }
        out.push_str(&render_entry(name, &meta.kernel, fs_uuid));
    }
    out
}

/// Select the newest `config.retained_deployments` good deployments,
/// render the drop-in script, and write it into `new_deployment` with
/// execute permission.
pub(crate) fn write_entries(
    config: &Config,
    new_deployment: &Utf8Path,
    fs_uuid: &str,
) -> Result<()> {
    let good = crate::metadata::good_deployments_newest_first(
        &config.deployments_dir(),
        config.retained_deployments,
    )?;
    let script = render(&good, fs_uuid);
    let dest = new_deployment.join(DROPIN_PATH);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest, script)?;
    let mut perms = std::fs::metadata(&dest)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&dest, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DeploymentStatus;

    fn meta(kernel: &str) -> DeploymentMeta {
        DeploymentMeta {
            created: "2024-01-01T00:00:00Z".parse().unwrap(),
            action: "initial".into(),
            parent: String::new(),
            kernel: kernel.into(),
            system_version: "abcd".into(),
            status: DeploymentStatus::Ready,
            rollback_reason: None,
        }
    }

    #[test]
    fn test_render_header_reemits_tail() {
        let out = render(&[], "uuid-1");
        assert_eq!(out, "#!/bin/sh\nexec tail -n +3 \"$0\"\n");
    }

    #[test]
    fn test_render_skips_missing_kernel() {
        let deployments = vec![
            ("hammer-A".to_string(), meta("")),
            ("hammer-B".to_string(), meta("6.1.0-18-amd64")),
        ];
        let out = render(&deployments, "uuid-1");
        assert!(!out.contains("hammer-A"));
        assert!(out.contains("hammer-B"));
        assert!(out.contains("root=UUID=uuid-1"));
        assert!(out.contains("rootflags=subvol=deployments/hammer-B"));
    }

    #[test]
    fn test_write_entries_sets_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let config = Config::rooted_at(root);
        std::fs::create_dir_all(config.deployments_dir()).unwrap();
        let new_dep = root.join("new-deployment");
        std::fs::create_dir_all(&new_dep).unwrap();

        write_entries(&config, &new_dep, "uuid-xyz").unwrap();

        let dest = new_dep.join(DROPIN_PATH);
        let perms = std::fs::metadata(&dest).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o755);
    }
}
