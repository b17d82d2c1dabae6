//! Dependency-closure extractor for the bootstrap root.
//!
//! Seed binaries are copied to the same relative path under the destination;
//! every library they need is copied, dereferenced, into one flat `lib`
//! directory (with `lib64 -> lib`), under the name the binary asks for.
//! Copying is idempotent: files already present are left alone.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::common::binary::{find_library, is_elf, readelf_needed};
use crate::common::fsentry::{classify, copy_file_preserving, resolve_in_root, PathKind};
use crate::error::BuildError;
use crate::interrupt;
use crate::process::Cmd;

/// Flat library directory inside the bootstrap root.
pub const LIB_DIR: &str = "lib";

/// One dependency as reported by a lister.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    /// File name the binary asks for (e.g. `libc.so.6`).
    pub name: String,
    /// Absolute path inside the root, or `None` if unresolved.
    pub path: Option<PathBuf>,
}

/// Lists the shared-library dependencies of a binary inside a root.
pub trait DependencyLister {
    /// `binary` is relative to (or absolute inside) `root`.
    fn list(&self, root: &Path, binary: &Path) -> Result<Vec<Dependency>>;
}

/// `chroot <root> ldd /<binary>`: the root's own dynamic linker resolves
/// the full, already flattened dependency list.
pub struct ChrootLdd;

impl DependencyLister for ChrootLdd {
    fn list(&self, root: &Path, binary: &Path) -> Result<Vec<Dependency>> {
        let in_root = Path::new("/").join(binary.strip_prefix("/").unwrap_or(binary));
        let result = Cmd::new("chroot")
            .arg_path(root)
            .arg("ldd")
            .arg_path(&in_root)
            .allow_fail()
            .run()
            .with_context(|| format!("Failed to run ldd on {}", in_root.display()))?;

        // ldd exits 1 for static binaries; that just means no dependencies.
        if !result.success() {
            debug!(binary = %in_root.display(), stderr = %result.stderr_trimmed(), "ldd reported no dependencies");
            return Ok(Vec::new());
        }
        Ok(parse_ldd_output(&result.stdout))
    }
}

/// Parse ldd output.
///
/// ```text
///     linux-vdso.so.1 (0x00007ffc...)
///     libc.so.6 => /lib64/libc.so.6 (0x00007f...)
///     libfoo.so.1 => not found
///     /lib64/ld-linux-x86-64.so.2 (0x00007f...)
/// ```
pub fn parse_ldd_output(output: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if let Some((name, rest)) = line.split_once("=>") {
            let name = name.trim().to_string();
            let rest = rest.trim();
            if rest.starts_with("not found") {
                deps.push(Dependency { name, path: None });
            } else if let Some(path) = rest.split_whitespace().next().filter(|p| p.starts_with('/')) {
                deps.push(Dependency {
                    name,
                    path: Some(PathBuf::from(path)),
                });
            }
            // "=> (0x...)" is the vdso on some systems.
        } else if line.starts_with('/') {
            if let Some(path) = line.split_whitespace().next() {
                let path = PathBuf::from(path);
                if let Some(name) = path.file_name() {
                    deps.push(Dependency {
                        name: name.to_string_lossy().into_owned(),
                        path: Some(path),
                    });
                }
            }
        }
    }

    deps
}

/// `readelf`-based lister. NEEDED entries are not flattened, so this one
/// expands them transitively. Never executes anything from the root.
pub struct Readelf;

impl DependencyLister for Readelf {
    fn list(&self, root: &Path, binary: &Path) -> Result<Vec<Dependency>> {
        let rel = binary.strip_prefix("/").unwrap_or(binary);
        let Some(real) = resolve_in_root(root, rel) else {
            return Err(BuildError::missing("binary", root.join(rel)).into());
        };

        let mut deps = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut queue = vec![real];

        if let Some(interp) = interpreter(&queue[0])? {
            let name = interp
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let found = resolve_in_root(root, &interp).map(|_| interp.clone());
            deps.insert(Dependency { name, path: found });
        }

        while let Some(object) = queue.pop() {
            if !seen.insert(object.clone()) {
                continue;
            }
            for name in readelf_needed(&object)? {
                let located = find_library(root, &name);
                let path = located
                    .as_ref()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|rel| Path::new("/").join(rel));
                if let Some(lib) = located.as_ref().and_then(|p| {
                    p.strip_prefix(root)
                        .ok()
                        .and_then(|rel| resolve_in_root(root, rel))
                }) {
                    queue.push(lib);
                }
                deps.insert(Dependency { name, path });
            }
        }

        Ok(deps.into_iter().collect())
    }
}

/// ELF program interpreter from `readelf -l`, if any.
fn interpreter(path: &Path) -> Result<Option<PathBuf>> {
    let result = Cmd::new("readelf")
        .arg("-l")
        .arg_path(path)
        .allow_fail()
        .run()?;
    if !result.success() {
        return Ok(None);
    }
    Ok(parse_interpreter(&result.stdout))
}

/// `[Requesting program interpreter: /lib64/ld-linux-x86-64.so.2]`
pub fn parse_interpreter(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let start = line.find("program interpreter:")? + "program interpreter:".len();
        let end = line.rfind(']')?;
        (start < end).then(|| PathBuf::from(line[start..end].trim()))
    })
}

#[derive(Debug, Clone, Default)]
pub struct ClosureReport {
    pub binaries_copied: usize,
    pub libraries_copied: usize,
    /// Files that were already in the destination.
    pub already_present: usize,
    /// Dependencies that could not be resolved in the source root.
    pub missing: Vec<String>,
}

impl ClosureReport {
    pub fn print(&self) {
        println!(
            "  Copied {} binaries and {} libraries ({} already present)",
            self.binaries_copied, self.libraries_copied, self.already_present
        );
        for name in &self.missing {
            println!("  [WARN] Unresolved dependency: {}", name);
        }
    }
}

/// Copy `seeds` (relative to `source_root`) and their dependency closure
/// into `dest_root`.
pub fn copy_closure(
    seeds: &[PathBuf],
    source_root: &Path,
    dest_root: &Path,
    lister: &dyn DependencyLister,
) -> Result<ClosureReport> {
    let lib_dir = dest_root.join(LIB_DIR);
    fs::create_dir_all(&lib_dir)
        .with_context(|| format!("Failed to create {}", lib_dir.display()))?;
    let lib64 = dest_root.join("lib64");
    if classify(&lib64) == PathKind::Missing {
        symlink(LIB_DIR, &lib64).context("Failed to create lib64 symlink")?;
    }

    let mut report = ClosureReport::default();
    let mut missing = BTreeSet::new();

    for seed in seeds {
        interrupt::check("closure")?;
        let rel = seed.strip_prefix("/").unwrap_or(seed);
        let real = resolve_in_root(source_root, rel)
            .filter(|p| classify(p) == PathKind::File)
            .ok_or_else(|| BuildError::missing("seed binary", source_root.join(rel)))?;

        let dest = dest_root.join(rel);
        if dest.exists() {
            report.already_present += 1;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_file_preserving(&real, &dest)?;
            report.binaries_copied += 1;
        }

        for dep in lister.list(source_root, rel)? {
            match locate(source_root, &dep) {
                Some(src) => {
                    let target = lib_dir.join(&dep.name);
                    if classify(&target) != PathKind::Missing {
                        report.already_present += 1;
                        continue;
                    }
                    copy_file_preserving(&src, &target)?;
                    debug!(lib = %dep.name, from = %src.display(), "copied library");
                    report.libraries_copied += 1;
                }
                None => {
                    warn!(seed = %rel.display(), lib = %dep.name, "dependency not found in source root");
                    missing.insert(dep.name);
                }
            }
        }
    }

    report.missing = missing.into_iter().collect();
    info!(
        binaries = report.binaries_copied,
        libraries = report.libraries_copied,
        missing = report.missing.len(),
        "closure copied"
    );
    Ok(report)
}

/// Real file behind a dependency, falling back to a search by name.
fn locate(root: &Path, dep: &Dependency) -> Option<PathBuf> {
    let by_path = dep.path.as_ref().and_then(|p| {
        let rel = p.strip_prefix("/").unwrap_or(p);
        resolve_in_root(root, rel)
    });
    by_path
        .or_else(|| {
            let found = find_library(root, &dep.name)?;
            let rel = found.strip_prefix(root).ok()?.to_path_buf();
            resolve_in_root(root, &rel)
        })
        .filter(|p| classify(p) == PathKind::File)
}

/// A dependency of a copied file that the destination cannot satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    /// Relative to the destination root.
    pub object: PathBuf,
    pub name: String,
}

/// Check that every ELF file in `dest_root` has all its dependencies in the
/// flat library directory.
pub fn verify_closure(
    dest_root: &Path,
    lister: &dyn DependencyLister,
) -> Result<Vec<UnresolvedDependency>> {
    let lib_dir = dest_root.join(LIB_DIR);
    let mut unresolved = Vec::new();

    for entry in WalkDir::new(dest_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !is_elf(entry.path()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dest_root)
            .unwrap_or(entry.path())
            .to_path_buf();

        for dep in lister.list(dest_root, &rel)? {
            if !lib_dir.join(&dep.name).exists() {
                unresolved.push(UnresolvedDependency {
                    object: rel.clone(),
                    name: dep.name,
                });
            }
        }
    }

    Ok(unresolved)
}
