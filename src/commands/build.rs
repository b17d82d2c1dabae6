//! Build command - runs the unit pipeline and the image stages.

use anyhow::{bail, Context, Result};
use std::fs;
use std::time::Instant;
use tracing::info;

use super::stages;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::context::BuildContext;
use crate::interrupt;
use crate::pipeline::{self, Report, RunOptions};
use crate::preflight;
use crate::sandbox::{Mounter, NoopMounter, SandboxGuard, SystemMounter};
use crate::unit::{load_manifest, BuildUnit};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Units whose checkpoints are dropped before the run.
    pub force: Vec<String>,
    pub continue_on_error: bool,
}

/// Full build: units, then normalize, harden, closure and image.
pub fn cmd_build(config: &Config, options: &BuildOptions) -> Result<()> {
    println!("=== Full rootforge Build ===\n");
    let build_start = Instant::now();
    preflight::check_before_build(config, true)?;

    let report = build_units(config, options)?;
    if !report.success() {
        bail!("Build stopped before the image stages");
    }

    println!();
    stages::run_image_stages(config)?;

    let total = build_start.elapsed().as_secs_f64();
    println!("\n=== Build Complete ({:.1}s) ===", total);
    Ok(())
}

/// Run only the unit pipeline.
pub fn cmd_units(config: &Config, options: &BuildOptions) -> Result<()> {
    preflight::check_before_build(config, false)?;
    let report = build_units(config, options)?;
    if !report.success() {
        bail!("Unit pipeline did not complete");
    }
    Ok(())
}

fn build_units(config: &Config, options: &BuildOptions) -> Result<Report> {
    interrupt::install()?;

    let units = load_manifest(&config.units)?;
    let checkpoints = CheckpointStore::open(&config.state);
    force_units(&checkpoints, &units, &options.force)?;

    fs::create_dir_all(&config.logs)
        .with_context(|| format!("Failed to create {}", config.logs.display()))?;

    let utils = config.utils.is_dir().then_some(config.utils.as_path());
    let guard = SandboxGuard::prepare(&config.root, utils, mounter(config))?;

    let ctx = BuildContext::new(config, &checkpoints, guard.sandbox());
    let report = pipeline::run(
        &ctx,
        &units,
        RunOptions {
            continue_on_error: options.continue_on_error,
        },
    );

    let teardown = guard.release();
    for (target, error) in &teardown.failed {
        println!("  [WARN] Failed to unmount {}: {}", target.display(), error);
    }
    info!(
        unmounted = teardown.unmounted.len(),
        failed = teardown.failed.len(),
        "sandbox released"
    );

    report.print();
    Ok(report)
}

/// Steps on the host get no mounts.
fn mounter(config: &Config) -> Box<dyn Mounter> {
    if config.chroot {
        Box::new(SystemMounter)
    } else {
        Box::new(NoopMounter)
    }
}

fn force_units(checkpoints: &CheckpointStore, units: &[BuildUnit], force: &[String]) -> Result<()> {
    for name in force {
        if !units.iter().any(|u| &u.name == name) {
            bail!("Unknown unit '{}' passed to --force", name);
        }
        if checkpoints.invalidate(name)? {
            println!("  Forcing rebuild of {}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::parse_manifest;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
[[unit]]
name = "zlib"
tier = 1

[[unit.step]]
phase = "install"
run = "true"
"#;

    #[test]
    fn test_force_units() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::open(temp.path());
        let units = parse_manifest(MANIFEST).unwrap();
        store.mark_complete("zlib", None).unwrap();

        force_units(&store, &units, &["zlib".to_string()]).unwrap();
        assert!(!store.is_complete("zlib", None));

        assert!(force_units(&store, &units, &["nope".to_string()]).is_err());
    }
}
