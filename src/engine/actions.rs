//! What each mode does to one (node, software) pair once it is stopped.

use anyhow::{bail, Context, Result};

use crate::remote::{ChecksumAlgorithm, RemoteSession};
use crate::state::NodeSoftwareSet;
use crate::topology::{CopyItem, NodeUpgradeInfo};
use crate::util::{sha256_file, shell_quote};

pub(super) fn add(session: &mut RemoteSession, info: &NodeUpgradeInfo, suffix: &str) -> Result<()> {
    for item in &info.copy {
        upload(session, info, item)?;
    }
    run_template(session, info, info.install_cmd.as_deref(), suffix)
}

/// Moves the live file aside to `<dest>.<suffix>` when present, then installs
/// the new one. The new version is active whether or not it existed before.
///
/// A retry under the same suffix never moves a file over an existing backup:
/// that backup is the only copy of the previous version. Destinations with no
/// previous version are recorded in `new_files` before anything is copied.
pub(super) fn upgrade(
    session: &mut RemoteSession,
    info: &NodeUpgradeInfo,
    suffix: &str,
    new_files: &mut NodeSoftwareSet,
) -> Result<()> {
    for item in &info.copy {
        let backup = item.backup_path(suffix);
        if new_files.contains(&info.node, &item.dest) {
            tracing::debug!(node = %info.node, dest = %item.dest, "installed by an earlier attempt");
        } else if session.file_exists(&backup)? {
            tracing::info!(node = %info.node, backup = %backup, "backup already taken; keeping it");
        } else if session.file_exists(&item.dest)? {
            session.run(&format!(
                "sudo mv -f {} {}",
                shell_quote(&item.dest),
                shell_quote(&backup)
            ))?;
        } else {
            new_files.add(&info.node, &item.dest);
        }
        upload(session, info, item)?;
    }
    run_template(session, info, info.upgrade_cmd.as_deref(), suffix)
}

/// Puts `<dest>.<suffix>` back over `<dest>`. Without a backup the live file
/// is only removed if the upgrade introduced it; anything else is an error.
pub(super) fn rollback(
    session: &mut RemoteSession,
    info: &NodeUpgradeInfo,
    suffix: &str,
    new_files: &NodeSoftwareSet,
) -> Result<()> {
    for item in &info.copy {
        let backup = item.backup_path(suffix);
        if session.file_exists(&backup)? {
            session.run(&format!(
                "sudo mv -f {} {}",
                shell_quote(&backup),
                shell_quote(&item.dest)
            ))?;
        } else if new_files.contains(&info.node, &item.dest) {
            session.run(&format!("sudo rm -f {}", shell_quote(&item.dest)))?;
        } else {
            bail!(
                "no backup {backup} on {}; leaving {} in place",
                info.node,
                item.dest
            );
        }
    }
    run_template(session, info, info.rollback_cmd.as_deref(), suffix)
}

pub(super) fn delete_rollback(
    session: &mut RemoteSession,
    info: &NodeUpgradeInfo,
    suffix: &str,
) -> Result<()> {
    for item in &info.copy {
        session.run(&format!("sudo rm -f {}", shell_quote(&item.backup_path(suffix))))?;
    }
    run_template(session, info, info.delete_rollback_cmd.as_deref(), suffix)
}

fn upload(session: &mut RemoteSession, info: &NodeUpgradeInfo, item: &CopyItem) -> Result<()> {
    tracing::debug!(node = %info.node, source = %item.source, dest = %item.dest, "copying");
    session
        .copy_local_file(&item.source, &item.dest, &item.permissions)
        .with_context(|| format!("copy {} to {}:{}", item.source, info.node, item.dest))?;
    if info.verify_checksum {
        verify_checksum(session, info, item)?;
    }
    Ok(())
}

fn verify_checksum(session: &mut RemoteSession, info: &NodeUpgradeInfo, item: &CopyItem) -> Result<()> {
    let source = item.local_source();
    let local = sha256_file(&source)
        .with_context(|| format!("Failed to hash {}", source.display()))?;
    let remote = session.checksum(&item.dest, ChecksumAlgorithm::Sha256)?;
    if !local.eq_ignore_ascii_case(&remote) {
        bail!(
            "checksum mismatch for {} on {}: local {local}, remote {remote}",
            item.dest,
            info.node
        );
    }
    Ok(())
}

fn run_template(
    session: &mut RemoteSession,
    info: &NodeUpgradeInfo,
    template: Option<&str>,
    suffix: &str,
) -> Result<()> {
    let Some(template) = template.filter(|template| !template.trim().is_empty()) else {
        return Ok(());
    };
    let command = info.render(template, suffix);
    let output = session.run(&command)?;
    if !output.trim().is_empty() {
        tracing::debug!(node = %info.node, software = %info.software, output = %output.trim(), "command output");
    }
    Ok(())
}
