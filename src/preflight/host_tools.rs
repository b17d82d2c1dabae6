//! Host tool availability checks.

use crate::artifact::iso::MKRESCUE_TOOLS;
use crate::config::Config;
use crate::harden::HardenMechanism;
use crate::process;

use super::CheckResult;

/// (tool, package, purpose)
type ToolSpec = (&'static str, &'static str, &'static str);

/// Needed to run build units at all.
const UNIT_TOOLS: &[ToolSpec] = &[("tar", "tar", "Required to extract source archives")];

/// Needed only when steps run chrooted inside the sandbox.
const SANDBOX_TOOLS: &[ToolSpec] = &[
    ("chroot", "coreutils", "Required to run steps inside the sandbox"),
    ("mount", "util-linux", "Required to prepare the sandbox"),
    ("umount", "util-linux", "Required to tear down the sandbox"),
];

/// Needed by the image stages after the units have built.
const IMAGE_TOOLS: &[ToolSpec] = &[
    ("mksquashfs", "squashfs-tools", "Required to create the root image"),
    ("bash", "bash", "Required to run the bootstrap archive pipeline"),
    ("cpio", "cpio", "Required to create the bootstrap archive"),
    ("gzip", "gzip", "Required to compress the bootstrap archive"),
];

/// Every host tool a full build touches.
pub fn check_host_tools(config: &Config) -> Vec<CheckResult> {
    let mut results = check_unit_tools(config);
    results.extend(check_image_tools(config));

    // The editor runs inside the root when steps are chrooted, so the host
    // copy is only advisory.
    if config.harden.contains(&HardenMechanism::ProgramHeader) {
        results.push(check_tool_exists(
            &config.phdr_editor,
            "paxctl",
            "Used by the program-header hardening mechanism",
            false,
        ));
    } else {
        results.push(CheckResult::skip(
            &config.phdr_editor,
            "program-header hardening disabled",
        ));
    }

    results
}

/// Tools the unit pipeline needs: the archiver, the step shell and, when
/// chrooting, the sandbox tools.
pub fn check_unit_tools(config: &Config) -> Vec<CheckResult> {
    let mut results = check_tools(UNIT_TOOLS);
    if config.chroot {
        // The step shell is resolved inside the root, not on the host.
        results.extend(check_tools(SANDBOX_TOOLS));
    } else {
        results.push(check_tool_exists(&config.shell, "bash", "Runs build steps", true));
    }
    results
}

/// Tools the normalize/harden/closure/image stages need.
pub fn check_image_tools(config: &Config) -> Vec<CheckResult> {
    let mut results = check_tools(IMAGE_TOOLS);
    if config.chroot {
        results.push(check_tool_exists(
            "ldd",
            "glibc",
            "Advisory; the closure runs the root's own ldd",
            false,
        ));
    } else {
        results.push(check_tool_exists(
            "readelf",
            "binutils",
            "Required for dependency closure without chroot",
            true,
        ));
    }
    results.push(check_mkrescue());
    results
}

fn check_tools(tools: &[ToolSpec]) -> Vec<CheckResult> {
    tools
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, true))
        .collect()
}

fn check_mkrescue() -> CheckResult {
    for tool in MKRESCUE_TOOLS {
        if let Some(path) = process::which(tool) {
            return CheckResult::pass_with(*tool, &path.display().to_string());
        }
    }
    CheckResult::fail(
        MKRESCUE_TOOLS[0],
        "Not found. Install 'grub2-tools-extra' (Fedora) or 'grub-common' (Debian). \
         Required to master the boot media",
    )
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}
