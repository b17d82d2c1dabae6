//! Security hardening pass.
//!
//! Applies a protection flag string to every executable ELF object under the
//! standard binary and library directories, through each enabled mechanism:
//! an extended attribute (`user.pax.flags`) and the program-header flags
//! written by an external editor run inside the root. A file counts as
//! hardened if any mechanism succeeded. Per-file failures are collected in
//! [`HardenStats`] and never abort the pass.

use anyhow::{bail, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::common::binary::is_elf;
use crate::interrupt;
use crate::process::Cmd;

/// Directories scanned, relative to the root.
pub const SCAN_DIRS: &[&str] = &[
    "usr/bin",
    "usr/sbin",
    "usr/lib",
    "usr/libexec",
    "usr/local/bin",
    "usr/local/sbin",
    "usr/local/lib",
];

pub const XATTR_NAME: &str = "user.pax.flags";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardenMechanism {
    Xattr,
    ProgramHeader,
}

impl HardenMechanism {
    pub fn name(self) -> &'static str {
        match self {
            HardenMechanism::Xattr => "xattr",
            HardenMechanism::ProgramHeader => "phdr",
        }
    }

    /// Parse a comma separated list such as `xattr,phdr`.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut mechanisms = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mechanism = match item {
                "xattr" => HardenMechanism::Xattr,
                "phdr" | "program-header" => HardenMechanism::ProgramHeader,
                other => bail!("unknown hardening mechanism '{}' (expected xattr or phdr)", other),
            };
            if !mechanisms.contains(&mechanism) {
                mechanisms.push(mechanism);
            }
        }
        Ok(mechanisms)
    }
}

/// How the pass applies flags.
#[derive(Debug, Clone)]
pub struct HardenOptions {
    pub flags: String,
    pub mechanisms: Vec<HardenMechanism>,
    /// Program-header editor, resolved inside the root when `chroot` is set.
    pub editor: String,
    pub chroot: bool,
}

#[derive(Debug, Clone)]
pub struct HardenFailure {
    /// Relative to the root.
    pub path: PathBuf,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HardenStats {
    /// Executable ELF files found.
    pub examined: usize,
    pub hardened: usize,
    pub failed: usize,
    /// Regular files skipped because they are not ELF.
    pub non_elf: usize,
    pub xattr_applied: usize,
    pub phdr_applied: usize,
    pub failures: Vec<HardenFailure>,
}

impl HardenStats {
    pub fn print(&self) {
        println!(
            "  Examined {} ELF files: {} hardened, {} failed ({} non-ELF skipped)",
            self.examined, self.hardened, self.failed, self.non_elf
        );
        println!(
            "  xattr: {}, program header: {}",
            self.xattr_applied, self.phdr_applied
        );
        for failure in self.failures.iter().take(10) {
            println!(
                "  [WARN] /{}: {}",
                failure.path.display(),
                failure.errors.join("; ")
            );
        }
        if self.failures.len() > 10 {
            println!("  [WARN] ... and {} more", self.failures.len() - 10);
        }
    }
}

/// Harden every executable ELF object under [`SCAN_DIRS`].
///
/// An operator interrupt stops the pass between files.
pub fn harden(root: &Path, options: &HardenOptions) -> Result<HardenStats> {
    if !root.is_dir() {
        bail!("root {} does not exist", root.display());
    }
    if options.mechanisms.is_empty() {
        warn!("no hardening mechanisms enabled");
    }

    let mut stats = HardenStats::default();

    for dir in SCAN_DIRS {
        let base = root.join(dir);
        // A symlinked scan dir (e.g. usr/local/lib -> ../lib) would be visited twice.
        if !base.is_dir() || base.is_symlink() {
            continue;
        }

        for entry in WalkDir::new(&base)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_elf(path) {
                stats.non_elf += 1;
                continue;
            }
            let executable = entry
                .metadata()
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false);
            if !executable {
                continue;
            }

            interrupt::check("harden")?;
            stats.examined += 1;
            let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            harden_file(root, path, &rel, options, &mut stats);
        }
    }

    interrupt::check("harden")?;
    info!(
        examined = stats.examined,
        hardened = stats.hardened,
        failed = stats.failed,
        "hardening pass finished"
    );
    Ok(stats)
}

fn harden_file(
    root: &Path,
    path: &Path,
    rel: &Path,
    options: &HardenOptions,
    stats: &mut HardenStats,
) {
    let mut applied = false;
    let mut errors = Vec::new();

    for mechanism in &options.mechanisms {
        let result = match mechanism {
            HardenMechanism::Xattr => set_xattr(path, &options.flags),
            HardenMechanism::ProgramHeader => set_program_header(root, path, rel, options),
        };
        match result {
            Ok(()) => {
                applied = true;
                match mechanism {
                    HardenMechanism::Xattr => stats.xattr_applied += 1,
                    HardenMechanism::ProgramHeader => stats.phdr_applied += 1,
                }
            }
            Err(e) => errors.push(format!("{}: {:#}", mechanism.name(), e)),
        }
    }

    if applied {
        stats.hardened += 1;
        if !errors.is_empty() {
            debug!(path = %rel.display(), errors = ?errors, "partially hardened");
        }
    } else {
        stats.failed += 1;
        debug!(path = %rel.display(), errors = ?errors, "hardening failed");
        stats.failures.push(HardenFailure {
            path: rel.to_path_buf(),
            errors,
        });
    }
}

/// Set `user.pax.flags` without following symlinks.
pub fn set_xattr(path: &Path, flags: &str) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let c_name = CString::new(XATTR_NAME)?;
    // SAFETY: both strings are NUL-terminated and outlive the call; the value
    // pointer/length pair describes `flags`.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            flags.as_ptr().cast(),
            flags.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn set_program_header(root: &Path, path: &Path, rel: &Path, options: &HardenOptions) -> Result<()> {
    let flag_arg = format!("-c{}", options.flags);
    let cmd = if options.chroot {
        Cmd::new("chroot")
            .arg_path(root)
            .arg(&options.editor)
            .arg(flag_arg)
            .arg_path(&Path::new("/").join(rel))
    } else {
        Cmd::new(&options.editor).arg(flag_arg).arg_path(path)
    };
    cmd.error_msg(format!("{} failed", options.editor))
        .interruptible()
        .run()?;
    Ok(())
}
