//! Path classification and metadata-preserving copies.
//!
//! Everything that has to decide "is this a file, a directory or a symlink"
//! calls [`classify`] once and matches on the result.

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Maximum symlink hops followed when resolving inside a root.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Dir,
    Symlink(PathBuf),
}

/// Classify a path without following a final symlink.
pub fn classify(path: &Path) -> PathKind {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return PathKind::Missing;
    };
    let ft = meta.file_type();
    if ft.is_symlink() {
        match fs::read_link(path) {
            Ok(target) => PathKind::Symlink(target),
            Err(_) => PathKind::Missing,
        }
    } else if ft.is_dir() {
        PathKind::Dir
    } else {
        // Device nodes, fifos and sockets are copied like files.
        PathKind::File
    }
}

/// Resolve `path` as if `root` were `/`, following every symlink.
///
/// Absolute link targets are interpreted relative to `root`, so a tree can be
/// inspected without chrooting into it. Returns `None` when the chain ends in
/// a missing entry or loops.
pub fn resolve_in_root(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, path);

    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(comp) = pending.pop() {
        if comp == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&comp);
        match classify(&root.join(&candidate)) {
            PathKind::Missing => return None,
            PathKind::Symlink(target) => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return None;
                }
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                push_components(&mut pending, &target);
            }
            PathKind::File | PathKind::Dir => resolved = candidate,
        }
    }

    Some(root.join(resolved))
}

/// Push the components of `path` so that the first one is popped first.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    let comps: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    stack.extend(comps.into_iter().rev());
}

/// Copy a regular file, keeping mode, timestamps and (when permitted) owner.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src).with_context(|| format!("Failed to stat {}", src.display()))?;
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    fs::set_permissions(dst, meta.permissions())?;
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )?;
    set_owner(dst, meta.uid(), meta.gid(), true);
    Ok(())
}

/// Give `dst` the owner `uid:gid`, returning whether that worked.
///
/// Fails without CAP_CHOWN; the copy is still usable, so the failure is only
/// logged. With `follow == false` a symlink itself is changed.
pub fn set_owner(dst: &Path, uid: u32, gid: u32, follow: bool) -> bool {
    let result = if follow {
        std::os::unix::fs::chown(dst, Some(uid), Some(gid))
    } else {
        std::os::unix::fs::lchown(dst, Some(uid), Some(gid))
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %dst.display(), uid, gid, error = %e, "ownership not preserved");
            false
        }
    }
}

/// Recreate a symlink with the same target text.
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    symlink(&target, dst).with_context(|| {
        format!(
            "Failed to create symlink {} -> {}",
            dst.display(),
            target.display()
        )
    })?;
    if let Ok(meta) = fs::symlink_metadata(src) {
        set_owner(dst, meta.uid(), meta.gid(), false);
        if let Err(e) = filetime::set_symlink_file_times(
            dst,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        ) {
            debug!(path = %dst.display(), error = %e, "symlink timestamps not preserved");
        }
    }
    Ok(())
}

/// Copy any entry (file, symlink or whole directory tree) to a path that does
/// not exist yet. Symlinks are reproduced, not followed.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    match classify(src) {
        PathKind::Missing => bail!("{} does not exist", src.display()),
        PathKind::File => copy_file_preserving(src, dst),
        PathKind::Symlink(_) => copy_symlink(src, dst),
        PathKind::Dir => {
            fs::create_dir_all(dst)?;
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
            }
            copy_dir_metadata(src, dst)
        }
    }
}

/// Apply a directory's mode, owner and timestamps to another directory.
pub fn copy_dir_metadata(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, meta.permissions())?;
    set_owner(dst, meta.uid(), meta.gid(), true);
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )?;
    Ok(())
}

/// Copy every entry of `src` into `dst`, replacing entries already present.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        remove_entry(&target)?;
        copy_entry(&entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

/// Remove whatever is at `path`. Missing paths are fine.
pub fn remove_entry(path: &Path) -> Result<()> {
    match classify(path) {
        PathKind::Missing => Ok(()),
        PathKind::Dir => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove {}", path.display())),
        PathKind::File | PathKind::Symlink(_) => {
            fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
        }
    }
}
