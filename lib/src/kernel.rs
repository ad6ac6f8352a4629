//! Kernel version discovery from an installed-package listing, and the
//! boot-file presence check used by the sanity check.

use camino::Utf8Path;

/// Split a kernel version string into alternating numeric and
/// non-numeric runs so versions compare the way `dpkg --compare-versions`
/// would for the common case (`6.1.0-18-amd64` < `6.5.0-1-amd64`),
/// without pulling in a full Debian version-comparison implementation.
fn version_key(v: &str) -> Vec<(u64, String)> {
    let mut key = Vec::new();
    let mut chars = v.chars().peekable();
    while chars.peek().is_some() {
        let digits: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_digit())).collect();
        let rest: String = std::iter::from_fn(|| chars.next_if(|c| !c.is_ascii_digit())).collect();
        let n: u64 = digits.parse().unwrap_or(0);
        key.push((n, rest));
    }
    key
}

/// Parse `dpkg -l`-style output (the installed-package list dumped to
/// `/tmp/packages.list` inside the chroot) and return the version suffix
/// of the highest `linux-image-<version>` package installed (`ii` status).
pub(crate) fn highest_kernel_version(packages_list: &str) -> Option<String> {
    let mut versions: Vec<String> = packages_list
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let status = cols.next()?;
            if !status.starts_with("ii") {
                return None;
            }
            let pkg = cols.next()?;
            pkg.strip_prefix("linux-image-").map(ToOwned::to_owned)
        })
        .filter(|v| v != "amd64" && v != "generic") // metapackages, not real versions
        .collect();
    versions.sort_by(|a, b| version_key(a).cmp(&version_key(b)));
    versions.pop()
}

/// True iff `<deployment>/boot/vmlinuz-<kernel>` and
/// `<deployment>/boot/initrd.img-<kernel>` both exist.
pub(crate) fn boot_files_exist(deployment: &Utf8Path, kernel: &str) -> bool {
    deployment.join("boot").join(format!("vmlinuz-{kernel}")).is_file()
        && deployment
            .join("boot")
            .join(format!("initrd.img-{kernel}"))
            .is_file()
}
