//! Build input and environment checks.

use std::fs;
use std::path::Path;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::process::Cmd;
use crate::unit::load_manifest;

use super::CheckResult;

/// Check the unit manifest parses and every referenced archive is present.
pub fn check_build_inputs(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let units = match load_manifest(&config.units) {
        Ok(units) => {
            results.push(CheckResult::pass_with(
                "unit manifest",
                &format!("{} units", units.len()),
            ));
            units
        }
        Err(e) => {
            results.push(CheckResult::fail("unit manifest", &format!("{:#}", e)));
            return results;
        }
    };

    let missing: Vec<String> = units
        .iter()
        .filter_map(|unit| unit.source_path(&config.sources))
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
    if missing.is_empty() {
        results.push(CheckResult::pass("source archives"));
    } else {
        results.push(CheckResult::fail(
            "source archives",
            &format!("{} missing: {}", missing.len(), missing.join(", ")),
        ));
    }

    if config.utils.is_dir() {
        results.push(CheckResult::pass_with(
            "shared utilities",
            &config.utils.display().to_string(),
        ));
    } else {
        results.push(CheckResult::warn(
            "shared utilities",
            &format!("{} not found - nothing will be staged", config.utils.display()),
        ));
    }

    results
}

/// Manifest readable, and archives present for every unit without a
/// checkpoint. Completed units may have had their archives pruned.
pub fn check_pending_inputs(config: &Config) -> Vec<CheckResult> {
    let units = match load_manifest(&config.units) {
        Ok(units) => units,
        Err(e) => return vec![CheckResult::fail("unit manifest", format!("{:#}", e))],
    };
    let mut results = vec![CheckResult::pass_with(
        "unit manifest",
        format!("{} units", units.len()),
    )];

    let store = CheckpointStore::open(&config.state);
    let mut required = Vec::new();
    let mut optional = Vec::new();
    for unit in units.iter().filter(|u| !store.is_complete(&u.name, None)) {
        if let Some(path) = unit.source_path(&config.sources).filter(|p| !p.is_file()) {
            let missing = path.display().to_string();
            if unit.non_fatal {
                optional.push(missing);
            } else {
                required.push(missing);
            }
        }
    }

    if !required.is_empty() {
        results.push(CheckResult::fail(
            "source archives",
            format!("{} missing: {}", required.len(), required.join(", ")),
        ));
    }
    if !optional.is_empty() {
        results.push(CheckResult::warn(
            "source archives (non-fatal units)",
            format!("{} missing: {}", optional.len(), optional.join(", ")),
        ));
    }
    if required.is_empty() && optional.is_empty() {
        results.push(CheckResult::pass("source archives"));
    }
    results
}

/// Check directories, privileges and disk space.
pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(check_writable("output dir", &config.output));
    results.push(check_writable("state dir", &config.state));

    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        results.push(CheckResult::pass("root privileges"));
    } else {
        results.push(CheckResult::warn(
            "root privileges",
            &format!(
                "running as uid {} - mounting and chroot will fail without root",
                euid
            ),
        ));
    }

    if let Some(check) = check_disk_space(&config.output) {
        results.push(check);
    }

    results
}

fn check_writable(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(name, &format!("Cannot create {}: {}", dir.display(), e));
    }
    let marker = dir.join(".preflight-test");
    match fs::write(&marker, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            CheckResult::pass_with(name, &dir.display().to_string())
        }
        Err(e) => CheckResult::fail(name, &format!("Cannot write to {}: {}", dir.display(), e)),
    }
}

/// Warn below 10GB free.
fn check_disk_space(dir: &Path) -> Option<CheckResult> {
    let result = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(dir)
        .allow_fail()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }
    let avail_bytes: u64 = result.stdout.lines().nth(1)?.trim().parse().ok()?;
    let free_gb = avail_bytes / (1024 * 1024 * 1024);
    Some(if free_gb < 10 {
        CheckResult::warn("disk space", &format!("{}GB free - a full build needs ~10GB", free_gb))
    } else {
        CheckResult::pass_with("disk space", &format!("{}GB free", free_gb))
    })
}
