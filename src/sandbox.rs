//! Sandboxed execution root.
//!
//! The sandbox is the installed tree itself with the host's virtual
//! filesystems mounted into it and the shared utility scripts staged under
//! `/usr/lib/rootforge`. Mount failures during `prepare` are logged and
//! recorded, not fatal. `teardown` detaches every attempted mount in reverse
//! order and is safe to call any number of times.

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::common::fsentry::copy_dir_contents;
use crate::error::BuildError;

/// In-sandbox directory holding the staged utilities.
pub const UTILS_IN_ROOT: &str = "usr/lib/rootforge";
/// In-sandbox parent of per-unit scratch directories.
pub const BUILD_IN_ROOT: &str = "build";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Mount a filesystem of the given type.
    Fs(&'static str),
    /// Recursive bind mount of a host path.
    RecursiveBind,
}

/// One virtual filesystem mounted into the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    /// Mount point relative to the sandbox root.
    pub target: &'static str,
    pub kind: MountKind,
    pub data: Option<&'static str>,
}

/// Mounts attempted by `prepare`, in order.
pub const MOUNT_TABLE: &[MountSpec] = &[
    MountSpec {
        source: "proc",
        target: "proc",
        kind: MountKind::Fs("proc"),
        data: None,
    },
    MountSpec {
        source: "sysfs",
        target: "sys",
        kind: MountKind::Fs("sysfs"),
        data: None,
    },
    MountSpec {
        source: "/dev",
        target: "dev",
        kind: MountKind::RecursiveBind,
        data: None,
    },
    MountSpec {
        source: "devpts",
        target: "dev/pts",
        kind: MountKind::Fs("devpts"),
        data: Some("gid=5,mode=620"),
    },
    MountSpec {
        source: "tmpfs",
        target: "run",
        kind: MountKind::Fs("tmpfs"),
        data: Some("mode=755"),
    },
    MountSpec {
        source: "tmpfs",
        target: "tmp",
        kind: MountKind::Fs("tmpfs"),
        data: Some("mode=1777"),
    },
];

/// Performs the actual mount syscalls. Replaced in tests.
pub trait Mounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Real mounts via mount(2) and lazy umount2(2).
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
        let (fstype, flags) = match spec.kind {
            MountKind::Fs(fstype) => (Some(fstype), MsFlags::empty()),
            MountKind::RecursiveBind => (None, MsFlags::MS_BIND | MsFlags::MS_REC),
        };
        mount(Some(spec.source), target, fstype, flags, spec.data)
            .with_context(|| format!("mount {} on {}", spec.source, target.display()))?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
            .with_context(|| format!("umount {}", target.display()))?;
        Ok(())
    }
}

/// Mounts nothing. Used when steps run on the host instead of in a chroot.
pub struct NoopMounter;

impl Mounter for NoopMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
        debug!(source = spec.source, target = %target.display(), "mount skipped");
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

/// Result of one mount attempt.
#[derive(Debug, Clone)]
pub struct MountOutcome {
    pub target: PathBuf,
    pub error: Option<String>,
}

impl MountOutcome {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-target unmount results, in the order they were attempted.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub unmounted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Sandbox {
    root: PathBuf,
    mounter: Box<dyn Mounter>,
    outcomes: Vec<MountOutcome>,
    /// Targets still to be detached, in mount order.
    attempted: Vec<PathBuf>,
    utils_staged: bool,
}

impl Sandbox {
    /// Create the root's directories, mount the virtual filesystems and stage
    /// shared utilities.
    ///
    /// Only failing to create the root itself is an error.
    pub fn prepare(root: &Path, utils: Option<&Path>, mounter: Box<dyn Mounter>) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create sandbox root {}", root.display()))?;
        for dir in [BUILD_IN_ROOT, UTILS_IN_ROOT] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create {}", root.join(dir).display()))?;
        }

        let mut sandbox = Self {
            root: root.to_path_buf(),
            mounter,
            outcomes: Vec::new(),
            attempted: Vec::new(),
            utils_staged: false,
        };

        for spec in MOUNT_TABLE {
            let target = root.join(spec.target);
            let result = fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create mount point {}", target.display()))
                .and_then(|_| {
                    sandbox.attempted.push(target.clone());
                    sandbox.mounter.mount(spec, &target)
                });

            let error = match result {
                Ok(()) => {
                    debug!(target = %target.display(), "mounted");
                    None
                }
                Err(e) => {
                    let failure = BuildError::SandboxFailure {
                        target: target.clone(),
                        message: format!("{:#}", e),
                    };
                    warn!("{}", failure);
                    println!("  [WARN] {}", failure);
                    Some(format!("{:#}", e))
                }
            };
            sandbox.outcomes.push(MountOutcome { target, error });
        }

        if let Some(utils) = utils {
            sandbox.utils_staged = sandbox.stage_utils(utils);
        }

        info!(
            root = %root.display(),
            mounted = sandbox.outcomes.iter().filter(|o| o.ok()).count(),
            failed = sandbox.outcomes.iter().filter(|o| !o.ok()).count(),
            "sandbox prepared"
        );
        Ok(sandbox)
    }

    fn stage_utils(&self, utils: &Path) -> bool {
        if !utils.is_dir() {
            debug!(utils = %utils.display(), "no shared utilities to stage");
            return false;
        }
        let dest = self.root.join(UTILS_IN_ROOT);
        match copy_dir_contents(utils, &dest) {
            Ok(n) => {
                debug!(count = n, dest = %dest.display(), "staged shared utilities");
                true
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "failed to stage shared utilities");
                println!("  [WARN] Failed to stage utilities: {:#}", e);
                false
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outcomes(&self) -> &[MountOutcome] {
        &self.outcomes
    }

    pub fn utils_staged(&self) -> bool {
        self.utils_staged
    }

    /// Host path of a unit's scratch build directory.
    pub fn scratch_parent(&self) -> PathBuf {
        self.root.join(BUILD_IN_ROOT)
    }

    /// Detach every attempted mount, last first. Errors are collected, not
    /// returned; a second call is a no-op.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(target) = self.attempted.pop() {
            match self.mounter.unmount(&target) {
                Ok(()) => report.unmounted.push(target),
                Err(e) => {
                    debug!(target = %target.display(), error = %format!("{:#}", e), "unmount failed");
                    report.failed.push((target, format!("{:#}", e)));
                }
            }
        }
        report
    }
}

/// Kernel view of this process's mount table.
pub const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Read [`MOUNTINFO`]. An absent file (no procfs) reads as an empty table.
pub fn read_mountinfo() -> Result<String> {
    match fs::read_to_string(MOUNTINFO) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not available, assuming no mounts", MOUNTINFO);
            Ok(String::new())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", MOUNTINFO)),
    }
}

/// Mount points at or below `dir` in `mountinfo` content, deepest first.
///
/// `dir` is canonicalized when it exists, since the kernel reports resolved
/// paths.
pub fn mounts_under(mountinfo: &str, dir: &Path) -> Vec<PathBuf> {
    let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let mut found: Vec<PathBuf> = mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .filter(|target| target.starts_with(&dir))
        .collect();
    found.sort();
    found.dedup();
    found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    found
}

/// Undo the octal escapes (`\040` and friends) mountinfo uses for
/// whitespace and backslashes.
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Owns a [`Sandbox`] and tears it down when dropped.
///
/// Dropping happens on success, on `?` early return and during panic
/// unwinding, so no exit path leaves mounts behind.
pub struct SandboxGuard {
    sandbox: Sandbox,
}

impl SandboxGuard {
    pub fn prepare(root: &Path, utils: Option<&Path>, mounter: Box<dyn Mounter>) -> Result<Self> {
        Ok(Self {
            sandbox: Sandbox::prepare(root, utils, mounter)?,
        })
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Tear down now and return the report.
    pub fn release(mut self) -> TeardownReport {
        self.sandbox.teardown()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let report = self.sandbox.teardown();
        if !report.unmounted.is_empty() || !report.failed.is_empty() {
            info!(
                unmounted = report.unmounted.len(),
                failed = report.failed.len(),
                "sandbox torn down"
            );
        }
        for (target, error) in &report.failed {
            debug!(target = %target.display(), error = %error, "unmount failed during teardown");
        }
    }
}
