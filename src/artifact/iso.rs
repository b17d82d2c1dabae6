//! Boot media builder.
//!
//! Stages an ISO root:
//!
//! ```text
//! boot/vmlinuz
//! boot/initrd.img
//! boot/grub/grub.cfg
//! live/rootfs.squashfs
//! ```
//!
//! and masters a hybrid BIOS/UEFI image with `grub-mkrescue`, followed by a
//! `<iso>.sha256` checksum file.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::initramfs::MEDIUM_IMAGE_PATH;
use super::{finish_artifact, require_input, temp_path};
use crate::checkpoint::fingerprint_file;
use crate::common::{write_file_with_dirs, WorkDir};
use crate::error::BuildError;
use crate::process::{self, Cmd};

/// Mastering tools, in order of preference.
pub const MKRESCUE_TOOLS: &[&str] = &["grub-mkrescue", "grub2-mkrescue"];

#[derive(Debug, Clone)]
pub struct BootMediaInputs {
    pub kernel: PathBuf,
    pub bootstrap: PathBuf,
    pub root_image: PathBuf,
    /// Used verbatim when set; otherwise [`render_grub_cfg`] output.
    pub grub_cfg: Option<PathBuf>,
    pub label: String,
}

/// Default boot loader configuration.
pub fn render_grub_cfg(label: &str) -> String {
    format!(
        r#"set timeout=5
set default=0

insmod all_video
insmod gfxterm
terminal_output console

menuentry "{label}" {{
    linux /boot/vmlinuz rootforge.label={label} quiet
    initrd /boot/initrd.img
}}

menuentry "{label} (serial console)" {{
    linux /boot/vmlinuz rootforge.label={label} console=ttyS0,115200n8
    initrd /boot/initrd.img
}}
"#,
        label = label
    )
}

/// Find a kernel in the installed tree.
///
/// Looks at `boot/vmlinuz`, then `boot/vmlinuz-*`, then
/// `usr/lib/modules/*/vmlinuz`; within a pattern the lexically last name wins.
pub fn find_kernel(root: &Path) -> Option<PathBuf> {
    let direct = root.join("boot/vmlinuz");
    if direct.is_file() {
        return Some(direct);
    }

    last_matching(&root.join("boot"), |p| {
        let name = p.file_name()?.to_str()?;
        (name.starts_with("vmlinuz-") && p.is_file()).then(|| p.to_path_buf())
    })
    .or_else(|| {
        last_matching(&root.join("usr/lib/modules"), |p| {
            let kernel = p.join("vmlinuz");
            kernel.is_file().then_some(kernel)
        })
    })
}

fn last_matching(dir: &Path, pick: impl Fn(&Path) -> Option<PathBuf>) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    entries.iter().rev().find_map(|p| pick(p.as_path()))
}

fn mkrescue_tool() -> Result<&'static str> {
    match MKRESCUE_TOOLS.iter().copied().find(|tool| process::exists(tool)) {
        Some(tool) => Ok(tool),
        None => bail!(
            "none of {} found. Install grub (grub2-tools-extra on Fedora, grub-common on Debian).",
            MKRESCUE_TOOLS.join(", ")
        ),
    }
}

fn copy_input(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Lay out the ISO root under `staging`.
pub fn stage_iso_root(inputs: &BootMediaInputs, staging: &Path) -> Result<()> {
    require_input("kernel", &inputs.kernel)?;
    require_input("bootstrap archive", &inputs.bootstrap)?;
    require_input("root image", &inputs.root_image)?;
    if let Some(cfg) = &inputs.grub_cfg {
        require_input("boot loader configuration", cfg)?;
    }

    copy_input(&inputs.kernel, &staging.join("boot/vmlinuz"))?;
    copy_input(&inputs.bootstrap, &staging.join("boot/initrd.img"))?;
    copy_input(&inputs.root_image, &staging.join(MEDIUM_IMAGE_PATH))?;

    let grub_cfg = staging.join("boot/grub/grub.cfg");
    match &inputs.grub_cfg {
        Some(cfg) => copy_input(cfg, &grub_cfg)?,
        None => write_file_with_dirs(&grub_cfg, render_grub_cfg(&inputs.label))?,
    }
    Ok(())
}

/// Write `<iso>.sha256` in `sha256sum` format. Returns the checksum path.
pub fn write_checksum(artifact: &Path) -> Result<PathBuf> {
    let hash = fingerprint_file(artifact)?;
    let filename = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".sha256");
    let checksum = artifact.with_file_name(name);
    fs::write(&checksum, format!("{}  {}\n", hash, filename))
        .with_context(|| format!("Failed to write {}", checksum.display()))?;
    Ok(checksum)
}

/// Master the boot media at `output`.
pub fn assemble_boot_media(inputs: &BootMediaInputs, output: &Path) -> Result<PathBuf> {
    let out_dir = output.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(out_dir)?;

    let staging = WorkDir::create(out_dir, "iso-root")?;
    stage_iso_root(inputs, staging.path())?;

    let tool = mkrescue_tool()?;
    println!("Mastering boot media with {}...", tool);

    let temp = temp_path(output);
    let _ = fs::remove_file(&temp);
    debug!(tool, staging = %staging.path().display(), "mastering boot media");

    let result = Cmd::new(tool)
        .arg("-o")
        .arg_path(&temp)
        .arg_path(staging.path())
        .arg("--")
        .arg("-volid")
        .arg(&inputs.label)
        .allow_fail()
        .run()?;

    if !result.success() {
        let _ = fs::remove_file(&temp);
        return Err(BuildError::assembly(
            "boot media",
            format!(
                "{} exited with code {}: {}",
                tool,
                result.code(),
                result.stderr_trimmed()
            ),
        )
        .into());
    }

    let size = finish_artifact("boot media", &temp, output)?;
    let checksum = write_checksum(output)?;

    info!(output = %output.display(), size, "boot media built");
    println!("  Boot media: {} ({} MB)", output.display(), size / 1024 / 1024);
    println!("  Checksum: {}", checksum.display());
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs(dir: &Path) -> BootMediaInputs {
        for name in ["vmlinuz", "initrd.img", "rootfs.squashfs"] {
            fs::write(dir.join(name), name).unwrap();
        }
        BootMediaInputs {
            kernel: dir.join("vmlinuz"),
            bootstrap: dir.join("initrd.img"),
            root_image: dir.join("rootfs.squashfs"),
            grub_cfg: None,
            label: "ROOTFORGE".to_string(),
        }
    }

    #[test]
    fn test_render_grub_cfg() {
        let cfg = render_grub_cfg("MYOS");
        assert!(cfg.contains("menuentry \"MYOS\""));
        assert!(cfg.contains("linux /boot/vmlinuz rootforge.label=MYOS"));
        assert!(cfg.contains("initrd /boot/initrd.img"));
    }

    #[test]
    fn test_stage_iso_root_layout() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("iso");
        stage_iso_root(&inputs(temp.path()), &staging).unwrap();

        assert_eq!(fs::read_to_string(staging.join("boot/vmlinuz")).unwrap(), "vmlinuz");
        assert!(staging.join("boot/initrd.img").is_file());
        assert!(staging.join("live/rootfs.squashfs").is_file());
        assert!(fs::read_to_string(staging.join("boot/grub/grub.cfg"))
            .unwrap()
            .contains("ROOTFORGE"));
    }

    #[test]
    fn test_supplied_grub_cfg_used_verbatim() {
        let temp = TempDir::new().unwrap();
        let mut inputs = inputs(temp.path());
        let cfg = temp.path().join("custom.cfg");
        fs::write(&cfg, "set timeout=0\n").unwrap();
        inputs.grub_cfg = Some(cfg);

        let staging = temp.path().join("iso");
        stage_iso_root(&inputs, &staging).unwrap();
        assert_eq!(
            fs::read_to_string(staging.join("boot/grub/grub.cfg")).unwrap(),
            "set timeout=0\n"
        );
    }

    #[test]
    fn test_missing_kernel_is_missing_input() {
        let temp = TempDir::new().unwrap();
        let mut inputs = inputs(temp.path());
        inputs.kernel = temp.path().join("nope");

        let err = assemble_boot_media(&inputs, &temp.path().join("out/x.iso")).unwrap_err();
        match BuildError::classify(&err) {
            Some(BuildError::MissingInput { what, .. }) => assert_eq!(what, "kernel"),
            other => panic!("unexpected {:?}", other),
        }
        // Staging is cleaned up.
        assert!(!temp.path().join("out/iso-root").exists());
    }

    #[test]
    fn test_find_kernel() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        assert!(find_kernel(root).is_none());

        fs::create_dir_all(root.join("usr/lib/modules/6.1.0")).unwrap();
        fs::write(root.join("usr/lib/modules/6.1.0/vmlinuz"), "k").unwrap();
        assert_eq!(
            find_kernel(root).unwrap(),
            root.join("usr/lib/modules/6.1.0/vmlinuz")
        );

        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("boot/vmlinuz-6.1.0"), "k").unwrap();
        fs::write(root.join("boot/vmlinuz-6.6.0"), "k").unwrap();
        fs::write(root.join("boot/config-6.6.0"), "c").unwrap();
        assert_eq!(find_kernel(root).unwrap(), root.join("boot/vmlinuz-6.6.0"));

        fs::write(root.join("boot/vmlinuz"), "k").unwrap();
        assert_eq!(find_kernel(root).unwrap(), root.join("boot/vmlinuz"));
    }

    #[test]
    fn test_write_checksum() {
        let temp = TempDir::new().unwrap();
        let iso = temp.path().join("rootforge.iso");
        fs::write(&iso, b"hello").unwrap();

        let checksum = write_checksum(&iso).unwrap();
        assert_eq!(checksum, temp.path().join("rootforge.iso.sha256"));
        assert_eq!(
            fs::read_to_string(checksum).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824  rootforge.iso\n"
        );
    }
}
