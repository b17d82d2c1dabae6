//! Root image builder.
//!
//! Packs the normalized, hardened tree into a read-only squashfs. Contents of
//! pseudo-filesystem mount points are left out but the directories stay, so
//! the live system can mount onto them.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{finish_artifact, temp_path};
use crate::error::BuildError;
use crate::process::Cmd;

pub const SQUASHFS_COMPRESSION: &str = "xz";

/// Exclusions passed to mksquashfs (with `-wildcards`).
pub const EXCLUDES: &[&str] = &[
    "proc/*",
    "sys/*",
    "dev/*",
    "run/*",
    "tmp/*",
    "build",
    "usr/lib/rootforge",
];

/// mksquashfs arguments after source and destination.
pub fn mksquashfs_args() -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-comp".into(),
        SQUASHFS_COMPRESSION.into(),
        "-noappend".into(),
        "-wildcards".into(),
        "-e".into(),
    ];
    args.extend(EXCLUDES.iter().map(|e| e.to_string()));
    args
}

/// Build `output` from `tree`.
pub fn assemble_root_image(tree: &Path, output: &Path) -> Result<PathBuf> {
    if !tree.is_dir() {
        return Err(BuildError::missing("installed tree", tree).into());
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    println!("Creating root image with {} compression...", SQUASHFS_COMPRESSION);
    let temp = temp_path(output);
    let _ = fs::remove_file(&temp);

    // Inherited stdio so mksquashfs can show its progress bar.
    let status = Cmd::new("mksquashfs")
        .arg_path(tree)
        .arg_path(&temp)
        .args(mksquashfs_args())
        .allow_fail()
        .run_interactive()?;

    if !status.success() {
        let _ = fs::remove_file(&temp);
        return Err(BuildError::assembly(
            "root image",
            format!("mksquashfs exited with code {}", status.code().unwrap_or(-1)),
        )
        .into());
    }

    let size = finish_artifact("root image", &temp, output)?;
    info!(output = %output.display(), size, "root image built");
    println!("  Root image: {} ({} MB)", output.display(), size / 1024 / 1024);
    Ok(output.to_path_buf())
}
