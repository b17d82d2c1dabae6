//! Configuration management for rootforge.
//!
//! Reads configuration from a `.env` file in the base directory and from the
//! process environment. Environment variables take precedence over `.env`.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::harden::HardenMechanism;

/// Default dynamic linker file name checked by the normalizer.
pub const DEFAULT_LINKER: &str = "ld-linux-x86-64.so.2";

/// Default closure seeds, relative to the installed tree.
pub const DEFAULT_SEEDS: &[&str] = &[
    "usr/bin/bash",
    "usr/bin/mount",
    "usr/bin/umount",
    "usr/sbin/switch_root",
    "usr/sbin/losetup",
    "usr/bin/mkdir",
    "usr/bin/sleep",
];

/// Rootforge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Installed tree; also the sandbox root build steps run in.
    pub root: PathBuf,
    /// Directory source archives are looked up in.
    pub sources: PathBuf,
    /// Build unit manifest.
    pub units: PathBuf,
    /// Checkpoint store directory.
    pub state: PathBuf,
    /// Per-step logs.
    pub logs: PathBuf,
    /// Artifact directory (root image, bootstrap archive, ISO).
    pub output: PathBuf,
    /// Shared utility scripts staged into the sandbox.
    pub utils: PathBuf,
    pub jobs: usize,
    pub step_timeout: Option<Duration>,
    /// Run steps inside the sandbox root with chroot.
    pub chroot: bool,
    pub shell: String,
    pub pax_flags: String,
    pub harden: Vec<HardenMechanism>,
    pub phdr_editor: String,
    pub linker: String,
    pub seeds: Vec<PathBuf>,
    pub iso_label: String,
    /// Kernel for the boot media. Searched for in the installed tree when unset.
    pub kernel: Option<PathBuf>,
    /// Boot loader configuration. Generated when unset.
    pub grub_cfg: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `.env` and the environment.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            let iter = dotenvy::from_path_iter(&env_path)
                .with_context(|| format!("Failed to read {}", env_path.display()))?;
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Malformed line in {}", env_path.display()))?;
                vars.insert(key, value);
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            vars.insert(key, value);
        }

        Self::from_vars(base_dir, &vars)
    }

    /// Build a configuration from an explicit variable map.
    pub fn from_vars(base_dir: &Path, vars: &HashMap<String, String>) -> Result<Self> {
        let path = |key: &str, default: &str| -> PathBuf {
            let raw = vars
                .get(key)
                .map(String::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(default);
            let path = PathBuf::from(raw);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        };
        let string = |key: &str, default: &str| -> String {
            vars.get(key)
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let jobs = match vars.get("ROOTFORGE_JOBS").filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => bail!("ROOTFORGE_JOBS must be a positive integer, got '{}'", raw),
            },
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let step_timeout = match vars.get("ROOTFORGE_STEP_TIMEOUT").filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => bail!(
                    "ROOTFORGE_STEP_TIMEOUT must be a number of seconds, got '{}'",
                    raw
                ),
            },
            None => None,
        };

        let chroot = match vars.get("ROOTFORGE_CHROOT").map(|s| s.to_ascii_lowercase()) {
            None => true,
            Some(v) if v.is_empty() => true,
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("ROOTFORGE_CHROOT must be a boolean, got '{}'", other),
            },
        };

        let harden = HardenMechanism::parse_list(&string("ROOTFORGE_HARDEN", "xattr,phdr"))?;

        let seeds = match vars.get("ROOTFORGE_SEEDS").filter(|s| !s.trim().is_empty()) {
            Some(raw) => raw
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| PathBuf::from(s.trim_start_matches('/')))
                .collect(),
            None => DEFAULT_SEEDS.iter().map(PathBuf::from).collect(),
        };

        let output = path("ROOTFORGE_OUTPUT", "output");
        let optional_path = |key: &str| -> Option<PathBuf> {
            vars.get(key)
                .filter(|s| !s.is_empty())
                .map(|raw| path(key, raw))
        };

        Ok(Self {
            root: path("ROOTFORGE_ROOT", "output/rootfs"),
            sources: path("ROOTFORGE_SOURCES", "sources"),
            units: path("ROOTFORGE_UNITS", "units.toml"),
            state: path("ROOTFORGE_STATE", "output/state"),
            logs: path("ROOTFORGE_LOGS", "output/logs"),
            output,
            utils: path("ROOTFORGE_UTILS", "utils"),
            jobs,
            step_timeout,
            chroot,
            shell: string("ROOTFORGE_SHELL", "/bin/bash"),
            pax_flags: string("ROOTFORGE_PAX_FLAGS", "m"),
            harden,
            phdr_editor: string("ROOTFORGE_PHDR_EDITOR", "paxctl"),
            linker: string("ROOTFORGE_LINKER", DEFAULT_LINKER),
            seeds,
            iso_label: string("ISO_LABEL", "ROOTFORGE"),
            kernel: optional_path("ROOTFORGE_KERNEL"),
            grub_cfg: optional_path("ROOTFORGE_GRUB_CFG"),
        })
    }

    /// Bootstrap closure root.
    pub fn closure_root(&self) -> PathBuf {
        self.output.join("bootstrap-root")
    }

    pub fn root_image(&self) -> PathBuf {
        self.output.join("rootfs.squashfs")
    }

    pub fn bootstrap_archive(&self) -> PathBuf {
        self.output.join("initrd.img")
    }

    pub fn iso_path(&self) -> PathBuf {
        self.output.join(format!("{}.iso", self.iso_label.to_lowercase()))
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        let mechanisms: Vec<&str> = self.harden.iter().map(|m| m.name()).collect();
        let seeds: Vec<String> = self
            .seeds
            .iter()
            .map(|s| s.display().to_string())
            .collect();

        println!("Configuration:");
        println!("  ROOTFORGE_ROOT: {}", self.root.display());
        println!("  ROOTFORGE_SOURCES: {}", self.sources.display());
        println!("  ROOTFORGE_UNITS: {}", self.units.display());
        println!("  ROOTFORGE_STATE: {}", self.state.display());
        println!("  ROOTFORGE_LOGS: {}", self.logs.display());
        println!("  ROOTFORGE_OUTPUT: {}", self.output.display());
        println!("  ROOTFORGE_UTILS: {}", self.utils.display());
        println!("  ROOTFORGE_JOBS: {}", self.jobs);
        match self.step_timeout {
            Some(t) => println!("  ROOTFORGE_STEP_TIMEOUT: {}s", t.as_secs()),
            None => println!("  ROOTFORGE_STEP_TIMEOUT: (none)"),
        }
        println!("  ROOTFORGE_CHROOT: {}", self.chroot);
        println!("  ROOTFORGE_SHELL: {}", self.shell);
        println!("  ROOTFORGE_PAX_FLAGS: {}", self.pax_flags);
        println!("  ROOTFORGE_HARDEN: {}", mechanisms.join(","));
        println!("  ROOTFORGE_PHDR_EDITOR: {}", self.phdr_editor);
        println!("  ROOTFORGE_LINKER: {}", self.linker);
        println!("  ROOTFORGE_SEEDS: {}", seeds.join(","));
        println!("  ISO_LABEL: {}", self.iso_label);
        match &self.kernel {
            Some(k) => println!("  ROOTFORGE_KERNEL: {}", k.display()),
            None => println!("  ROOTFORGE_KERNEL: (search installed tree)"),
        }
        match &self.grub_cfg {
            Some(g) => println!("  ROOTFORGE_GRUB_CFG: {}", g.display()),
            None => println!("  ROOTFORGE_GRUB_CFG: (generated)"),
        }
        if self.units.exists() {
            println!("  Unit manifest: FOUND");
        } else {
            println!("  Unit manifest: NOT FOUND");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let base = Path::new("/work");
        let config = Config::from_vars(base, &HashMap::new()).unwrap();

        assert_eq!(config.root, PathBuf::from("/work/output/rootfs"));
        assert_eq!(config.state, PathBuf::from("/work/output/state"));
        assert_eq!(config.units, PathBuf::from("/work/units.toml"));
        assert!(config.chroot);
        assert!(config.step_timeout.is_none());
        assert_eq!(config.pax_flags, "m");
        assert_eq!(config.linker, DEFAULT_LINKER);
        assert_eq!(config.harden.len(), 2);
        assert_eq!(config.seeds.len(), DEFAULT_SEEDS.len());
        assert!(config.jobs >= 1);
    }

    #[test]
    fn test_relative_and_absolute_paths() {
        let base = Path::new("/work");
        let config = Config::from_vars(
            base,
            &vars(&[("ROOTFORGE_ROOT", "/mnt/root"), ("ROOTFORGE_SOURCES", "src")]),
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/mnt/root"));
        assert_eq!(config.sources, PathBuf::from("/work/src"));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let base = Path::new("/work");
        assert!(Config::from_vars(base, &vars(&[("ROOTFORGE_JOBS", "lots")])).is_err());
        assert!(Config::from_vars(base, &vars(&[("ROOTFORGE_JOBS", "0")])).is_err());
        assert!(Config::from_vars(base, &vars(&[("ROOTFORGE_CHROOT", "maybe")])).is_err());
        assert!(Config::from_vars(base, &vars(&[("ROOTFORGE_STEP_TIMEOUT", "1h")])).is_err());
        assert!(Config::from_vars(base, &vars(&[("ROOTFORGE_HARDEN", "magic")])).is_err());
    }

    #[test]
    fn test_overrides() {
        let base = Path::new("/work");
        let config = Config::from_vars(
            base,
            &vars(&[
                ("ROOTFORGE_JOBS", "3"),
                ("ROOTFORGE_STEP_TIMEOUT", "90"),
                ("ROOTFORGE_CHROOT", "false"),
                ("ROOTFORGE_HARDEN", "xattr"),
                ("ROOTFORGE_SEEDS", "/usr/bin/busybox, usr/bin/sh"),
                ("ROOTFORGE_KERNEL", "kernel/bzImage"),
            ]),
        )
        .unwrap();

        assert_eq!(config.jobs, 3);
        assert_eq!(config.step_timeout, Some(Duration::from_secs(90)));
        assert!(!config.chroot);
        assert_eq!(config.harden, vec![HardenMechanism::Xattr]);
        assert_eq!(
            config.seeds,
            vec![PathBuf::from("usr/bin/busybox"), PathBuf::from("usr/bin/sh")]
        );
        assert_eq!(config.kernel, Some(PathBuf::from("/work/kernel/bzImage")));
        assert!(config.grub_cfg.is_none());
    }

    #[test]
    fn test_load_reads_dotenv() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "# comment\nROOTFORGE_PHDR_EDITOR=\"paxctl-ng\"\n",
        )
        .unwrap();

        let config = Config::load(temp.path()).unwrap();
        // Environment may override, but normally it's unset in test runs.
        if std::env::var("ROOTFORGE_PHDR_EDITOR").is_err() {
            assert_eq!(config.phdr_editor, "paxctl-ng");
        }
    }
}
