//! Post-build stages: normalize, harden, closure and image assembly.
//!
//! Each runs on its own from the CLI; `build` chains them once the unit
//! pipeline has succeeded.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::artifact::{self, BootMediaInputs};
use crate::closure::{self, ChrootLdd, DependencyLister, Readelf};
use crate::config::Config;
use crate::error::BuildError;
use crate::harden::{self, HardenOptions};
use crate::interrupt;
use crate::normalize;
use crate::timing::Timer;

/// normalize, harden, closure, image.
pub fn run_image_stages(config: &Config) -> Result<()> {
    interrupt::check("normalize")?;
    cmd_normalize(config)?;
    interrupt::check("harden")?;
    cmd_harden(config)?;
    interrupt::check("closure")?;
    cmd_closure(config, false)?;
    interrupt::check("image")?;
    cmd_image(config)?;
    Ok(())
}

pub fn cmd_normalize(config: &Config) -> Result<()> {
    println!("=== Normalizing filesystem layout ===");
    let t = Timer::start("Normalize");
    let report = normalize::normalize(&config.root, &config.linker)?;
    report.print();
    t.finish();
    Ok(())
}

pub fn cmd_harden(config: &Config) -> Result<()> {
    println!("=== Applying hardening flags ===");
    let t = Timer::start("Harden");
    let options = HardenOptions {
        flags: config.pax_flags.clone(),
        mechanisms: config.harden.clone(),
        editor: config.phdr_editor.clone(),
        chroot: config.chroot,
    };
    let stats = harden::harden(&config.root, &options)?;
    stats.print();
    t.finish();
    Ok(())
}

/// Copy the seed closure into the bootstrap root. With `verify`, also check
/// every copied object resolves against the flat library directory.
pub fn cmd_closure(config: &Config, verify: bool) -> Result<()> {
    println!("=== Extracting bootstrap closure ===");
    let t = Timer::start("Closure");
    let lister: Box<dyn DependencyLister> = if config.chroot {
        Box::new(ChrootLdd)
    } else {
        Box::new(Readelf)
    };
    let report = closure::copy_closure(
        &config.seeds,
        &config.root,
        &config.closure_root(),
        lister.as_ref(),
    )?;
    report.print();
    t.finish();

    if verify {
        // The bootstrap root has no ldd of its own.
        let unresolved = closure::verify_closure(&config.closure_root(), &Readelf)?;
        if !unresolved.is_empty() {
            for dep in &unresolved {
                println!("  [FAIL] /{} needs {}", dep.object.display(), dep.name);
            }
            bail!("{} unresolved dependencies in the bootstrap closure", unresolved.len());
        }
        println!("  Closure verified: all dependencies present");
    }
    Ok(())
}

/// Build root image, bootstrap archive and boot media.
pub fn cmd_image(config: &Config) -> Result<()> {
    println!("=== Assembling images ===");

    let t = Timer::start("Root image");
    let root_image = artifact::assemble_root_image(&config.root, &config.root_image())?;
    t.finish();

    interrupt::check("image")?;
    let t = Timer::start("Bootstrap archive");
    let init = artifact::render_init(&config.iso_label);
    let bootstrap =
        artifact::assemble_bootstrap(&config.closure_root(), &init, &config.bootstrap_archive())?;
    t.finish();

    interrupt::check("image")?;
    let t = Timer::start("Boot media");
    let inputs = BootMediaInputs {
        kernel: kernel_path(config)?,
        bootstrap,
        root_image,
        grub_cfg: config.grub_cfg.clone(),
        label: config.iso_label.clone(),
    };
    artifact::assemble_boot_media(&inputs, &config.iso_path())?;
    t.finish();
    Ok(())
}

fn kernel_path(config: &Config) -> Result<PathBuf> {
    match &config.kernel {
        Some(kernel) => Ok(kernel.clone()),
        None => artifact::find_kernel(&config.root).ok_or_else(|| {
            BuildError::missing("kernel", config.root.join("boot/vmlinuz")).into()
        }),
    }
}
