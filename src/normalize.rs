//! Filesystem normalizer - collapses the split root layout into `/usr`.
//!
//! Legacy top-level directories (`/bin`, `/sbin`, `/lib`, `/lib64`) that are
//! real directories are merged into their `/usr` counterparts and replaced by
//! symlinks. The merge never overwrites: an entry already present under
//! `/usr` wins. Entries from `/lib64` that are symlinks are dereferenced and
//! the real file copied, since their relative targets stop resolving once
//! `/lib64` becomes a link to `usr/lib`.
//!
//! Every copy happens before any legacy directory is removed, so symlink
//! resolution always sees the original layout.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::common::fsentry::{
    classify, copy_entry, copy_file_preserving, copy_symlink, resolve_in_root, PathKind,
};
use crate::error::BuildError;

/// Legacy directory and the unified directory it folds into.
pub const LEGACY_DIRS: &[(&str, &str)] = &[
    ("bin", "usr/bin"),
    ("sbin", "usr/sbin"),
    ("lib", "usr/lib"),
    ("lib64", "usr/lib"),
];

/// Directories whose dangling symlinks are repaired after the merge.
const UNIFIED_DIRS: &[&str] = &["usr/bin", "usr/sbin", "usr/lib"];

/// Never searched for the linker.
const PSEUDO_DIRS: &[&str] = &["proc", "sys", "dev", "run", "tmp", "build"];

#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    /// Legacy directories replaced by symlinks.
    pub converted: Vec<String>,
    pub copied: usize,
    /// Symlinks copied as their resolved real file.
    pub dereferenced: usize,
    /// Entries not copied because the unified directory already had them.
    pub skipped: usize,
    /// Dangling symlinks re-pointed after the merge.
    pub repaired: usize,
    /// Dangling symlinks nothing could be found for (relative to the root).
    pub unresolved: Vec<PathBuf>,
    /// Set when the linker had to be recovered from elsewhere in the tree.
    pub linker_recovered_from: Option<PathBuf>,
}

impl NormalizeReport {
    pub fn print(&self) {
        if self.converted.is_empty() {
            println!("  Layout already unified");
        } else {
            println!("  Unified: /{}", self.converted.join(", /"));
        }
        println!(
            "  Copied {} entries ({} dereferenced), kept {} existing",
            self.copied, self.dereferenced, self.skipped
        );
        if self.repaired > 0 {
            println!("  Repaired {} dangling symlinks", self.repaired);
        }
        for path in &self.unresolved {
            println!("  [WARN] Dangling symlink: /{}", path.display());
        }
        if let Some(from) = &self.linker_recovered_from {
            println!("  [WARN] Dynamic linker recovered from /{}", from.display());
        }
    }
}

/// Normalize the tree at `root` in place.
///
/// `linker` is the dynamic linker's file name; it must exist as a regular
/// file in `usr/lib` afterwards or the tree cannot boot.
pub fn normalize(root: &Path, linker: &str) -> Result<NormalizeReport> {
    let mut report = NormalizeReport::default();

    let legacy: Vec<(&str, &str)> = LEGACY_DIRS
        .iter()
        .copied()
        .filter(|(dir, _)| match classify(&root.join(dir)) {
            PathKind::Dir => true,
            PathKind::Symlink(target) => {
                debug!(dir, target = %target.display(), "already a symlink");
                false
            }
            PathKind::Missing => false,
            PathKind::File => {
                warn!(dir, "legacy path is a regular file, leaving it alone");
                false
            }
        })
        .collect();

    for (dir, unified) in &legacy {
        fs::create_dir_all(root.join(unified))
            .with_context(|| format!("Failed to create /{}", unified))?;
        let dereference = *dir == "lib64";
        merge_dir(root, Path::new(dir), Path::new(unified), dereference, &mut report)
            .with_context(|| format!("Failed to merge /{} into /{}", dir, unified))?;
    }

    for (dir, unified) in &legacy {
        let path = root.join(dir);
        fs::remove_dir_all(&path).with_context(|| format!("Failed to remove /{}", dir))?;
        symlink(unified, &path).with_context(|| format!("Failed to create /{} symlink", dir))?;
        info!(dir, unified, "legacy directory unified");
        report.converted.push(dir.to_string());
    }

    repair_dangling(root, &mut report)?;
    ensure_linker(root, linker, &mut report)?;

    Ok(report)
}

fn merge_dir(
    root: &Path,
    src_rel: &Path,
    dst_rel: &Path,
    dereference: bool,
    report: &mut NormalizeReport,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(root.join(src_rel))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    entries.sort();

    for name in entries {
        let src_rel = src_rel.join(&name);
        let dst_rel = dst_rel.join(&name);
        let src = root.join(&src_rel);
        let dst = root.join(&dst_rel);

        match (classify(&src), classify(&dst)) {
            (PathKind::Dir, PathKind::Dir) => {
                merge_dir(root, &src_rel, &dst_rel, dereference, report)?;
            }
            (PathKind::Symlink(target), PathKind::Missing) if dereference => {
                match resolve_in_root(root, &src_rel) {
                    Some(real) => {
                        match classify(&real) {
                            PathKind::File => copy_file_preserving(&real, &dst)?,
                            _ => copy_entry(&real, &dst)?,
                        }
                        debug!(
                            from = %src_rel.display(),
                            real = %real.display(),
                            "dereferenced"
                        );
                        report.dereferenced += 1;
                        report.copied += 1;
                    }
                    None => {
                        // Left for the repair pass.
                        warn!(path = %src_rel.display(), target = %target.display(), "dangling symlink");
                        copy_symlink(&src, &dst)?;
                        report.copied += 1;
                    }
                }
            }
            (PathKind::Missing, _) => {}
            (_, PathKind::Missing) => {
                copy_entry(&src, &dst)?;
                report.copied += 1;
            }
            _ => report.skipped += 1,
        }
    }

    Ok(())
}

/// Re-point dangling symlinks directly inside the unified directories at a
/// same-named file in any of them.
fn repair_dangling(root: &Path, report: &mut NormalizeReport) -> Result<()> {
    for dir in UNIFIED_DIRS {
        let dir_path = root.join(dir);
        let Ok(entries) = fs::read_dir(&dir_path) else {
            continue;
        };
        let mut links: Vec<(PathBuf, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| match classify(&e.path()) {
                PathKind::Symlink(target) => Some((e.path(), target)),
                _ => None,
            })
            .collect();
        links.sort();

        for (link, target) in links {
            let Ok(rel) = link.strip_prefix(root) else {
                continue;
            };
            if resolve_in_root(root, rel).is_some() {
                continue;
            }
            let Some(wanted) = target.file_name() else {
                report.unresolved.push(rel.to_path_buf());
                continue;
            };

            let replacement = UNIFIED_DIRS.iter().find_map(|candidate_dir| {
                let rel_candidate = Path::new(candidate_dir).join(wanted);
                let resolved = resolve_in_root(root, &rel_candidate)?;
                (classify(&resolved) == PathKind::File).then_some(*candidate_dir)
            });

            match replacement {
                Some(candidate_dir) => {
                    let new_target = if candidate_dir == *dir {
                        PathBuf::from(wanted)
                    } else {
                        let leaf = Path::new(candidate_dir)
                            .file_name()
                            .map(PathBuf::from)
                            .unwrap_or_default();
                        Path::new("..").join(leaf).join(wanted)
                    };
                    fs::remove_file(&link)?;
                    symlink(&new_target, &link).with_context(|| {
                        format!("Failed to repair symlink {}", link.display())
                    })?;
                    debug!(link = %rel.display(), target = %new_target.display(), "repaired");
                    report.repaired += 1;
                }
                None => report.unresolved.push(rel.to_path_buf()),
            }
        }
    }
    Ok(())
}

/// Make sure `usr/lib/<linker>` is a real file.
fn ensure_linker(root: &Path, linker: &str, report: &mut NormalizeReport) -> Result<()> {
    let rel = Path::new("usr/lib").join(linker);
    let path = root.join(&rel);

    match classify(&path) {
        PathKind::File => return Ok(()),
        PathKind::Symlink(_) => {
            if let Some(real) = resolve_in_root(root, &rel) {
                if classify(&real) == PathKind::File {
                    // Replace the link with the file it points at.
                    let tmp = path.with_extension("rootforge-tmp");
                    copy_file_preserving(&real, &tmp)?;
                    fs::rename(&tmp, &path)?;
                    debug!(linker, real = %real.display(), "materialized linker symlink");
                    return Ok(());
                }
            }
            fs::remove_file(&path)?;
        }
        PathKind::Dir => {
            return Err(BuildError::NormalizationInvariantViolation {
                linker: linker.to_string(),
            }
            .into())
        }
        PathKind::Missing => {}
    }

    let Some(found) = search_linker(root, linker) else {
        return Err(BuildError::NormalizationInvariantViolation {
            linker: linker.to_string(),
        }
        .into());
    };

    fs::create_dir_all(root.join("usr/lib"))?;
    copy_file_preserving(&found, &path)?;
    let from = found.strip_prefix(root).unwrap_or(&found).to_path_buf();
    warn!(linker, from = %from.display(), "dynamic linker recovered by search");
    report.linker_recovered_from = Some(from);
    Ok(())
}

/// First regular file named `linker` anywhere in the tree, in sorted walk order.
fn search_linker(root: &Path, linker: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| PSEUDO_DIRS.contains(&n)))
        })
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == linker)
        .map(|e| e.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LINKER: &str = "ld-linux-x86-64.so.2";

    #[test]
    fn test_lib64_relative_symlink_is_dereferenced() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("lib64")).unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/ld-2.39.so"), "\x7fELF linker").unwrap();
        symlink("../lib/ld-2.39.so", root.join("lib64").join(LINKER)).unwrap();

        let report = normalize(root, LINKER).unwrap();

        let linker = root.join("usr/lib").join(LINKER);
        assert_eq!(classify(&linker), PathKind::File);
        assert_eq!(fs::read_to_string(&linker).unwrap(), "\x7fELF linker");
        assert_eq!(
            classify(&root.join("lib64")),
            PathKind::Symlink(PathBuf::from("usr/lib"))
        );
        assert_eq!(report.dereferenced, 1);
        assert!(report.linker_recovered_from.is_none());
    }

    #[test]
    fn test_existing_unified_entries_win() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib").join(LINKER), "ld").unwrap();
        fs::write(root.join("bin/sh"), "old").unwrap();
        fs::write(root.join("bin/ls"), "ls").unwrap();
        fs::write(root.join("usr/bin/sh"), "new").unwrap();

        let report = normalize(root, LINKER).unwrap();

        assert_eq!(fs::read_to_string(root.join("usr/bin/sh")).unwrap(), "new");
        assert_eq!(fs::read_to_string(root.join("usr/bin/ls")).unwrap(), "ls");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.copied, 1);
        assert_eq!(report.converted, vec!["bin"]);
        // Through the new symlink.
        assert_eq!(fs::read_to_string(root.join("bin/ls")).unwrap(), "ls");
    }

    #[test]
    fn test_nested_directories_merge() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("lib/modules/6.6")).unwrap();
        fs::create_dir_all(root.join("usr/lib/modules/6.1")).unwrap();
        fs::write(root.join("lib/modules/6.6/modules.dep"), "").unwrap();
        fs::write(root.join("usr/lib").join(LINKER), "ld").unwrap();

        normalize(root, LINKER).unwrap();

        assert!(root.join("usr/lib/modules/6.6/modules.dep").is_file());
        assert!(root.join("usr/lib/modules/6.1").is_dir());
    }

    #[test]
    fn test_linker_recovered_by_search() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("opt/glibc/lib")).unwrap();
        fs::write(root.join("opt/glibc/lib").join(LINKER), "found").unwrap();

        let report = normalize(root, LINKER).unwrap();

        assert_eq!(
            fs::read_to_string(root.join("usr/lib").join(LINKER)).unwrap(),
            "found"
        );
        assert_eq!(
            report.linker_recovered_from,
            Some(PathBuf::from("opt/glibc/lib").join(LINKER))
        );
    }

    #[test]
    fn test_missing_linker_is_invariant_violation() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("bin")).unwrap();

        let err = normalize(temp.path(), LINKER).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::NormalizationInvariantViolation { .. })
        ));
    }

    #[test]
    fn test_linker_symlink_is_materialized() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/ld-2.39.so"), "real").unwrap();
        symlink("ld-2.39.so", root.join("usr/lib").join(LINKER)).unwrap();

        normalize(root, LINKER).unwrap();

        assert_eq!(classify(&root.join("usr/lib").join(LINKER)), PathKind::File);
    }

    #[test]
    fn test_dangling_symlink_repaired() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/sbin")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib").join(LINKER), "ld").unwrap();
        fs::write(root.join("usr/sbin/agetty"), "bin").unwrap();
        symlink("../../sbin/agetty", root.join("usr/bin/getty")).unwrap();
        symlink("nowhere", root.join("usr/bin/ghost")).unwrap();

        let report = normalize(root, LINKER).unwrap();

        assert_eq!(report.repaired, 1);
        assert_eq!(
            classify(&root.join("usr/bin/getty")),
            PathKind::Symlink(PathBuf::from("../sbin/agetty"))
        );
        assert_eq!(report.unresolved, vec![PathBuf::from("usr/bin/ghost")]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib").join(LINKER), "ld").unwrap();

        normalize(root, LINKER).unwrap();
        let second = normalize(root, LINKER).unwrap();

        assert!(second.converted.is_empty());
        assert_eq!(second.copied, 0);
    }
}
