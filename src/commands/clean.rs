//! Clean command - removes build outputs.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::sandbox::{mounts_under, read_mountinfo};

/// Clean target for the clean command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    /// Artifacts and the bootstrap root (default)
    Outputs,
    /// Step logs
    Logs,
    /// Checkpoints, forcing every unit to rebuild
    State,
    /// Everything under the output directory, including the installed tree
    All,
}

/// Execute the clean command.
///
/// Refuses to delete anything with a live mount below it, such as the
/// sandbox's `dev` bind left behind by a killed run.
pub fn cmd_clean(config: &Config, target: CleanTarget) -> Result<()> {
    clean(config, target, &read_mountinfo()?)
}

fn clean(config: &Config, target: CleanTarget, mountinfo: &str) -> Result<()> {
    let remove = |path: &Path| remove_path(path, mountinfo);
    match target {
        CleanTarget::Outputs => {
            let iso = config.iso_path();
            let mut checksum = iso.clone().into_os_string();
            checksum.push(".sha256");
            for file in [
                config.root_image(),
                config.bootstrap_archive(),
                iso,
                checksum.into(),
            ] {
                remove(&file)?;
            }
            remove(&config.closure_root())?;
        }
        CleanTarget::Logs => remove(&config.logs)?,
        CleanTarget::State => remove(&config.state)?,
        CleanTarget::All => {
            remove(&config.logs)?;
            remove(&config.state)?;
            remove(&config.output)?;
        }
    }
    println!("Clean complete.");
    Ok(())
}

fn remove_path(path: &Path, mountinfo: &str) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if meta.is_dir() {
        let mounted = mounts_under(mountinfo, path);
        if !mounted.is_empty() {
            for target in &mounted {
                println!("  [FAIL] still mounted: {}", target.display());
            }
            bail!(
                "Refusing to remove {}: {} mount(s) still active below it (umount -R them first)",
                path.display(),
                mounted.len()
            );
        }
    }
    println!("Removing {}...", path.display());
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.with_context(|| format!("Failed to remove {}", path.display()))
}
