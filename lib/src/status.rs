//! Human-readable rendering for `hammer status` and `hammer history`.

use crate::engine::DeploymentMeta;

/// Render the `status` output: the current deployment's name followed by
/// its metadata fields in an indented key/value layout.
pub(crate) fn render_status(name: &str, meta: &DeploymentMeta) -> String {
    let mut out = format!("{name}\n");
    out.push_str(&format!("    Status: {}\n", meta.status));
    out.push_str(&format!("    Created: {}\n", meta.created.to_rfc3339()));
    out.push_str(&format!("    Action: {}\n", meta.action));
    if !meta.parent.is_empty() {
        out.push_str(&format!("    Parent: {}\n", meta.parent));
    }
    if !meta.kernel.is_empty() {
        out.push_str(&format!("    Kernel: {}\n", meta.kernel));
    }
    if !meta.system_version.is_empty() {
        out.push_str(&format!("    System version: {}\n", meta.system_version));
    }
    if let Some(reason) = &meta.rollback_reason {
        out.push_str(&format!("    Rollback reason: {reason}\n"));
    }
    out
}

/// Render the `history` output: every deployment newest first, one line
/// each, with a `*` marking the one `current` resolves to.
pub(crate) fn render_history(entries: &[(String, DeploymentMeta, bool)]) -> String {
    let mut out = String::new();
    for (name, meta, is_current) in entries {
        let marker = if *is_current { "*" } else { " " };
        out.push_str(&format!(
            "{marker} {name}  {}  {}  {}\n",
            meta.status,
            meta.created.to_rfc3339(),
            meta.action
        ));
    }
    out
}
