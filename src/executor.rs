//! Build unit executor.
//!
//! Runs one unit at most once per checkpoint: consult the store, extract the
//! source into a scratch directory, run each step inside the sandbox, then
//! record the checkpoint. The scratch directory is removed on every exit
//! path; a failed or interrupted unit never gets a checkpoint.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::checkpoint::fingerprint_file;
use crate::common::{tail_lines, write_file_mode, WorkDir};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::interrupt;
use crate::process::Cmd;
use crate::timing::Timer;
use crate::unit::{BuildUnit, Phase, Step};

/// Number of log lines attached to a step failure.
pub const LOG_EXCERPT_LINES: usize = 40;

const CHROOT_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// A matching checkpoint existed; nothing ran.
    Skipped,
    Built { steps_run: usize, elapsed: Duration },
}

/// Execute `unit` in the context's sandbox.
pub fn execute(ctx: &BuildContext, unit: &BuildUnit) -> Result<UnitOutcome> {
    if interrupt::is_interrupted() {
        return Err(BuildError::Interrupted {
            unit: unit.name.clone(),
        }
        .into());
    }

    let source = unit.source_path(&ctx.config.sources);
    let fingerprint = match &source {
        // A pruned archive only matters if the unit has to be rebuilt.
        Some(path) if !path.is_file() => {
            if ctx.checkpoints.is_complete(&unit.name, None) {
                println!("  [SKIP] {} (already built, source archive gone)", unit.name);
                debug!(unit = %unit.name, archive = %path.display(), "checkpoint exists, archive missing");
                return Ok(UnitOutcome::Skipped);
            }
            return Err(
                BuildError::missing(format!("source archive for '{}'", unit.name), path).into(),
            );
        }
        Some(path) => Some(fingerprint_file(path)?),
        None => None,
    };

    if ctx.checkpoints.is_complete(&unit.name, fingerprint.as_deref()) {
        println!("  [SKIP] {} (already built)", unit.name);
        debug!(unit = %unit.name, "checkpoint matches, skipping");
        return Ok(UnitOutcome::Skipped);
    }

    println!("  Building {} (tier {})...", unit.name, unit.tier);
    info!(unit = %unit.name, tier = unit.tier, fingerprint = ?fingerprint, "building unit");
    let timer = Timer::start(&unit.name);

    let log_dir = ctx.unit_log_dir(&unit.name);
    crate::common::cleanup_work_dir(&log_dir);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let scratch = WorkDir::create(&ctx.build_dir(), &unit.name)?;

    if let Some(archive) = &source {
        extract(ctx, unit, archive, scratch.path(), &log_dir)?;
    }
    let src_dir = find_source_dir(scratch.path())?;

    let mut steps_run = 0;
    for (index, step) in unit.steps.iter().enumerate() {
        if interrupt::is_interrupted() {
            return Err(BuildError::Interrupted {
                unit: unit.name.clone(),
            }
            .into());
        }
        run_step(ctx, unit, index, step, scratch.path(), &src_dir, &log_dir)?;
        steps_run += 1;
    }

    ctx.checkpoints
        .mark_complete(&unit.name, fingerprint.as_deref())
        .with_context(|| format!("Failed to record checkpoint for '{}'", unit.name))?;

    let elapsed = timer.elapsed();
    timer.finish();
    Ok(UnitOutcome::Built { steps_run, elapsed })
}

fn extract(
    ctx: &BuildContext,
    unit: &BuildUnit,
    archive: &Path,
    scratch: &Path,
    log_dir: &Path,
) -> Result<()> {
    let log = log_dir.join("extract.log");
    debug!(unit = %unit.name, archive = %archive.display(), "extracting");

    // tar detects the compression itself.
    let result = Cmd::new("tar")
        .arg("-xf")
        .arg_path(archive)
        .arg("-C")
        .arg_path(scratch)
        .log_to(&log)
        .timeout(ctx.config.step_timeout)
        .interruptible()
        .allow_fail()
        .run()?;

    if !result.success() {
        return Err(BuildError::StepFailure {
            unit: unit.name.clone(),
            phase: "extract".to_string(),
            code: result.code(),
            log_excerpt: tail_lines(&log, LOG_EXCERPT_LINES),
        }
        .into());
    }
    Ok(())
}

/// The single top-level directory of an extracted archive, or the scratch
/// directory itself when there isn't exactly one.
pub fn find_source_dir(scratch: &Path) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = fs::read_dir(scratch)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    if let [only] = dirs.as_slice() {
        return Ok(only.clone());
    }
    Ok(scratch.to_path_buf())
}

/// Render a step body as a standalone script.
pub fn step_script(shell: &str, src_dir: &Path, body: &str) -> String {
    let mut script = format!("#!{}\nset -e\n", shell);
    if shell.ends_with("bash") {
        script.push_str("set -o pipefail\n");
    }
    script.push_str(&format!("cd '{}'\n\n", src_dir.display()));
    script.push_str(body);
    if !body.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Environment every step runs with.
pub fn step_env(ctx: &BuildContext, unit: &BuildUnit, src_dir: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let (path, home) = if ctx.config.chroot {
        (CHROOT_PATH.to_string(), "/root".to_string())
    } else {
        (
            std::env::var("PATH").unwrap_or_else(|_| CHROOT_PATH.to_string()),
            std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()),
        )
    };
    env.insert("PATH".to_string(), path);
    env.insert("HOME".to_string(), home);
    env.insert("LC_ALL".to_string(), "POSIX".to_string());
    env.insert("MAKEFLAGS".to_string(), format!("-j{}", ctx.config.jobs));
    env.insert("ROOTFORGE_UNIT".to_string(), unit.name.clone());
    env.insert(
        "ROOTFORGE_SRCDIR".to_string(),
        ctx.step_path(src_dir).display().to_string(),
    );
    // Install destination as seen by the step: "/" inside the chroot, the
    // root's host path otherwise.
    let root = ctx.step_path(ctx.root()).display().to_string();
    env.insert("ROOTFORGE_ROOT".to_string(), root.clone());
    env.insert("DESTDIR".to_string(), root);
    env.insert(
        "ROOTFORGE_UTILS".to_string(),
        ctx.utils_path().display().to_string(),
    );
    for (key, value) in &unit.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn run_step(
    ctx: &BuildContext,
    unit: &BuildUnit,
    index: usize,
    step: &Step,
    scratch: &Path,
    src_dir: &Path,
    log_dir: &Path,
) -> Result<()> {
    let script_path = scratch.join(format!("{:02}-{}.sh", index + 1, step.phase));
    let script = step_script(&ctx.config.shell, &ctx.step_path(src_dir), &step.run);
    write_file_mode(&script_path, script, 0o755)?;

    let log = log_dir.join(format!("{}.log", step.phase));
    let env = step_env(ctx, unit, src_dir);
    let script_arg = ctx.step_path(&script_path);

    let cmd = if ctx.config.chroot {
        Cmd::new("chroot")
            .arg_path(ctx.root())
            .arg(&ctx.config.shell)
            .arg_path(&script_arg)
    } else {
        Cmd::new(&ctx.config.shell).arg_path(&script_arg).dir(src_dir)
    };

    debug!(unit = %unit.name, phase = %step.phase, script = %script_path.display(), "running step");
    let outcome = cmd
        .env_clear()
        .envs(&env)
        .log_to(&log)
        .timeout(ctx.config.step_timeout)
        .interruptible()
        .allow_fail()
        .run();

    let code = match outcome {
        Ok(result) if result.success() => return Ok(()),
        Ok(result) => result.code(),
        Err(e) => {
            // Timed out or could not be spawned; the reason goes into the log.
            let _ = append_line(&log, &format!("rootforge: {:#}", e));
            -1
        }
    };

    if interrupt::is_interrupted() {
        return Err(BuildError::Interrupted {
            unit: unit.name.clone(),
        }
        .into());
    }

    if step.phase == Phase::Test && step.allow_failure {
        warn!(unit = %unit.name, code, "test step failed, continuing");
        println!(
            "  [WARN] {}: test step failed (exit code {}), continuing",
            unit.name, code
        );
        return Ok(());
    }

    Err(BuildError::StepFailure {
        unit: unit.name.clone(),
        phase: step.phase.to_string(),
        code,
        log_excerpt: tail_lines(&log, LOG_EXCERPT_LINES),
    }
    .into())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_source_dir_single_top_level() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("zlib-1.3.1")).unwrap();

        assert_eq!(
            find_source_dir(temp.path()).unwrap(),
            temp.path().join("zlib-1.3.1")
        );
    }

    #[test]
    fn test_find_source_dir_flat_archive() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        fs::create_dir(temp.path().join("doc")).unwrap();
        fs::write(temp.path().join("Makefile"), "").unwrap();

        assert_eq!(find_source_dir(temp.path()).unwrap(), temp.path());
    }

    #[test]
    fn test_step_script() {
        let script = step_script("/bin/bash", Path::new("/build/zlib/zlib-1.3.1"), "make");
        assert!(script.starts_with("#!/bin/bash\nset -e\nset -o pipefail\n"));
        assert!(script.contains("cd '/build/zlib/zlib-1.3.1'"));
        assert!(script.ends_with("make\n"));

        let sh = step_script("sh", Path::new("/tmp"), "true\n");
        assert!(!sh.contains("pipefail"));
    }
}
