//! Build artifacts - root image, bootstrap archive and boot media.
//!
//! - `squashfs` - compressed read-only root image
//! - `initramfs` - bootstrap archive (closure root + generated /init)
//! - `iso` - hybrid BIOS/UEFI boot media
//!
//! The byte-level work is done by external tools. Each builder writes to a
//! temporary path, renames it into place and checks that the result exists
//! and is non-empty.

pub mod initramfs;
pub mod iso;
pub mod squashfs;

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

pub use initramfs::{assemble_bootstrap, render_init};
pub use iso::{assemble_boot_media, find_kernel, render_grub_cfg, BootMediaInputs};
pub use squashfs::assemble_root_image;

/// Temporary sibling of `output` used while a tool is writing.
pub(crate) fn temp_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    output.with_file_name(name)
}

/// Fail with `AssemblyFailure` unless `path` is a non-empty file. Returns its size.
pub fn verify_artifact(artifact: &str, path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(BuildError::assembly(artifact, format!("{} is empty", path.display())).into()),
        Err(_) => {
            Err(BuildError::assembly(artifact, format!("{} was not created", path.display())).into())
        }
    }
}

/// Require an input file, raising `MissingInput` when absent.
pub(crate) fn require_input(what: &str, path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(BuildError::missing(what, path).into());
    }
    Ok(())
}

/// Move the finished temp file into place and verify it.
pub(crate) fn finish_artifact(artifact: &str, temp: &Path, output: &Path) -> Result<u64> {
    verify_artifact(artifact, temp)?;
    fs::rename(temp, output).map_err(|e| {
        BuildError::assembly(
            artifact,
            format!("failed to move {} into place: {}", temp.display(), e),
        )
    })?;
    verify_artifact(artifact, output)
}
