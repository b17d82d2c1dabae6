//! Bootstrap archive builder.
//!
//! The closure extractor leaves a minimal root containing the seed tools and
//! their libraries. This adds a generated `/init` plus the directories it
//! mounts onto, then packs everything as a gzip-compressed newc cpio archive.

use anyhow::Result;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{finish_artifact, temp_path};
use crate::common::{classify, write_file_mode, PathKind};
use crate::error::BuildError;
use crate::process::Cmd;

/// Directories the init script needs, relative to the bootstrap root.
pub const BOOTSTRAP_DIRS: &[&str] = &[
    "dev",
    "proc",
    "sys",
    "run",
    "tmp",
    "usr/bin",
    "usr/sbin",
    "mnt/medium",
    "mnt/rootfs",
    "mnt/overlay",
    "newroot",
];

/// Compatibility links so `/bin/...` paths resolve.
const BOOTSTRAP_LINKS: &[(&str, &str)] = &[("bin", "usr/bin"), ("sbin", "usr/sbin")];

/// Path of the root image on the boot medium.
pub const MEDIUM_IMAGE_PATH: &str = "live/rootfs.squashfs";

/// Generate the `/init` script.
///
/// Mounts the kernel filesystems, finds the medium carrying the root image
/// (by label when udev-style links exist, otherwise by probing block devices
/// for the image), loop-mounts the image under a tmpfs overlay and switches
/// into it.
pub fn render_init(label: &str) -> String {
    format!(
        r#"#!/usr/bin/bash
# Generated by rootforge.
export PATH=/usr/bin:/usr/sbin

LABEL="{label}"
IMAGE="{image}"

mount -t proc proc /proc
mount -t sysfs sysfs /sys
mount -t devtmpfs devtmpfs /dev

rescue() {{
    echo "init: $1"
    echo "init: dropping to a shell"
    exec bash
}}

find_medium() {{
    if [ -b "/dev/disk/by-label/$LABEL" ]; then
        if mount -o ro "/dev/disk/by-label/$LABEL" /mnt/medium 2>/dev/null; then
            [ -f "/mnt/medium/$IMAGE" ] && return 0
            umount /mnt/medium
        fi
    fi
    for dev in /dev/sr* /dev/vd* /dev/sd* /dev/nvme*n* /dev/mmcblk*; do
        [ -b "$dev" ] || continue
        mount -o ro "$dev" /mnt/medium 2>/dev/null || continue
        [ -f "/mnt/medium/$IMAGE" ] && return 0
        umount /mnt/medium
    done
    return 1
}}

found=
for attempt in 1 2 3 4 5 6 7 8 9 10; do
    if find_medium; then
        found=1
        break
    fi
    sleep 1
done
[ -n "$found" ] || rescue "no medium labelled $LABEL carries /$IMAGE"

mount -t squashfs -o ro,loop "/mnt/medium/$IMAGE" /mnt/rootfs || rescue "cannot mount root image"
mount -t tmpfs -o mode=755 tmpfs /mnt/overlay || rescue "cannot mount overlay tmpfs"
mkdir -p /mnt/overlay/upper /mnt/overlay/work
mount -t overlay overlay \
    -o lowerdir=/mnt/rootfs,upperdir=/mnt/overlay/upper,workdir=/mnt/overlay/work \
    /newroot || rescue "cannot mount overlay"

mount --move /dev /newroot/dev
mount --move /proc /newroot/proc
mount --move /sys /newroot/sys

exec switch_root /newroot /sbin/init
"#,
        label = label,
        image = MEDIUM_IMAGE_PATH,
    )
}

/// Add `/init` and the minimal layout to `root`.
pub fn stage_bootstrap_root(root: &Path, init_script: &str) -> Result<()> {
    for dir in BOOTSTRAP_DIRS {
        fs::create_dir_all(root.join(dir))?;
    }
    for (link, target) in BOOTSTRAP_LINKS {
        let path = root.join(link);
        if classify(&path) == PathKind::Missing {
            symlink(target, &path)?;
        }
    }
    write_file_mode(root.join("init"), init_script, 0o755)?;
    Ok(())
}

/// Build the bootstrap archive at `output` from `closure_root`.
pub fn assemble_bootstrap(closure_root: &Path, init_script: &str, output: &Path) -> Result<PathBuf> {
    if !closure_root.is_dir() {
        return Err(BuildError::missing("bootstrap closure root", closure_root).into());
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    stage_bootstrap_root(closure_root, init_script)?;

    println!("Creating bootstrap archive...");
    let temp = temp_path(output);
    let _ = fs::remove_file(&temp);

    pack_archive(closure_root, &temp, None)?;

    let size = finish_artifact("bootstrap archive", &temp, output)?;
    info!(output = %output.display(), size, "bootstrap archive built");
    println!("  Bootstrap archive: {} ({} KB)", output.display(), size / 1024);
    Ok(output.to_path_buf())
}

/// Pack `root` into `temp` with `find | cpio | gzip`.
///
/// The pipeline runs under pipefail so a failing `find` or `cpio` is not
/// masked by gzip's exit status. `search_path` replaces `PATH` for the
/// pipeline when set.
fn pack_archive(root: &Path, temp: &Path, search_path: Option<&str>) -> Result<()> {
    // The output path is passed positionally so it never needs quoting.
    let mut cmd = Cmd::new("bash")
        .args(["-o", "pipefail", "-c"])
        .arg("find . -print0 | cpio --null -o -H newc --quiet | gzip -9 > \"$1\"")
        .arg("bash")
        .arg_path(temp)
        .dir(root)
        .allow_fail();
    if let Some(path) = search_path {
        cmd = cmd.env("PATH", path);
    }
    let result = cmd.run()?;

    if !result.success() {
        let _ = fs::remove_file(temp);
        return Err(BuildError::assembly(
            "bootstrap archive",
            format!(
                "cpio pipeline failed (exit code {}): {}",
                result.code(),
                result.stderr_trimmed()
            ),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_render_init() {
        let init = render_init("ROOTFORGE");
        assert!(init.starts_with("#!/usr/bin/bash\n"));
        assert!(init.contains("LABEL=\"ROOTFORGE\""));
        assert!(init.contains("IMAGE=\"live/rootfs.squashfs\""));
        assert!(init.contains("mount -t proc proc /proc"));
        assert!(init.contains("mount -t overlay overlay"));
        assert!(init.contains("exec switch_root /newroot /sbin/init"));
    }

    #[test]
    fn test_stage_bootstrap_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/bash"), "").unwrap();

        stage_bootstrap_root(root, "#!/usr/bin/bash\n").unwrap();

        let mode = fs::metadata(root.join("init")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(root.join("newroot").is_dir());
        assert!(root.join("mnt/medium").is_dir());
        assert_eq!(fs::read_link(root.join("bin")).unwrap(), PathBuf::from("usr/bin"));
        assert!(root.join("bin/bash").exists());

        // Staging twice is harmless.
        stage_bootstrap_root(root, "#!/usr/bin/bash\n").unwrap();
    }

    #[test]
    fn test_missing_closure_root() {
        let temp = TempDir::new().unwrap();
        let err = assemble_bootstrap(&temp.path().join("nope"), "", &temp.path().join("initrd.img"))
            .unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_assemble_bootstrap() {
        if !process::exists("cpio") || !process::exists("gzip") {
            println!("cpio/gzip not installed, skipping");
            return;
        }
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("bootstrap-root");
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/libc.so.6"), "libc").unwrap();
        let output = temp.path().join("out/initrd.img");

        assemble_bootstrap(&root, &render_init("TEST"), &output).unwrap();

        let bytes = fs::read(&output).unwrap();
        // gzip magic
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert!(!temp_path(&output).exists());
    }

    #[test]
    fn test_failing_cpio_is_assembly_failure() {
        if !process::exists("bash") || !process::exists("gzip") {
            println!("bash/gzip not installed, skipping");
            return;
        }
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("bootstrap-root");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/sh"), "sh").unwrap();

        // A cpio that swallows its input and fails; gzip still exits 0.
        let bin = temp.path().join("bin");
        write_file_mode(bin.join("cpio"), "#!/bin/sh\ncat > /dev/null\nexit 2\n", 0o755).unwrap();
        let search_path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );

        let archive = temp.path().join("initrd.img.tmp");
        let err = pack_archive(&root, &archive, Some(&search_path)).unwrap_err();

        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::AssemblyFailure { .. })
        ));
        assert!(format!("{:#}", err).contains("exit code 2"));
        assert!(!archive.exists());
    }
}
