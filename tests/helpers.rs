//! Shared test utilities for rootforge tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tempfile::TempDir;

use rootforge::checkpoint::CheckpointStore;
use rootforge::closure::{Dependency, DependencyLister};
use rootforge::config::Config;
use rootforge::context::BuildContext;
use rootforge::pipeline::{self, Report, RunOptions};
use rootforge::sandbox::{MountSpec, Mounter, NoopMounter, Sandbox};
use rootforge::unit::load_manifest;

/// Test environment: a base directory with config pointing inside it.
///
/// Steps run on the host with `sh`, so nothing needs root.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub base_dir: PathBuf,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_vars(&[])
    }

    /// Extra configuration on top of the test defaults.
    pub fn with_vars(extra: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();

        let mut vars: HashMap<String, String> = [
            ("ROOTFORGE_CHROOT", "false"),
            ("ROOTFORGE_SHELL", "sh"),
            ("ROOTFORGE_JOBS", "2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }

        let config = Config::from_vars(&base_dir, &vars).expect("Failed to build config");
        fs::create_dir_all(&config.sources).expect("Failed to create sources dir");

        Self {
            _temp_dir: temp_dir,
            base_dir,
            config,
        }
    }

    /// File every test step appends its unit name to.
    pub fn trace_path(&self) -> PathBuf {
        self.base_dir.join("trace.log")
    }

    /// Lines written to the trace file so far.
    pub fn trace(&self) -> Vec<String> {
        fs::read_to_string(self.trace_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn write_manifest(&self, content: &str) {
        fs::write(&self.config.units, content).expect("Failed to write manifest");
    }

    /// Create `sources/<name>` as a gzip tarball with one top-level directory.
    pub fn make_archive(&self, name: &str, top: &str, files: &[(&str, &str)]) -> PathBuf {
        let staging = self.base_dir.join("archive-staging");
        let _ = fs::remove_dir_all(&staging);
        for (path, content) in files {
            let file = staging.join(top).join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }

        let archive = self.config.sources.join(name);
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&staging)
            .arg(top)
            .status()
            .expect("Failed to run tar");
        assert!(status.success(), "tar failed");
        fs::remove_dir_all(&staging).unwrap();
        archive
    }

    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::open(&self.config.state)
    }

    /// Run the whole manifest once with no mounts.
    pub fn run(&self, options: RunOptions) -> Report {
        self.run_with_mounter(options, Box::new(NoopMounter))
    }

    pub fn run_with_mounter(&self, options: RunOptions, mounter: Box<dyn Mounter>) -> Report {
        let units = load_manifest(&self.config.units).expect("Failed to load manifest");
        let store = self.store();
        let mut sandbox =
            Sandbox::prepare(&self.config.root, None, mounter).expect("Failed to prepare sandbox");
        let report = {
            let ctx = BuildContext::new(&self.config, &store, &sandbox);
            pipeline::run(&ctx, &units, options)
        };
        sandbox.teardown();
        report
    }

    /// Snapshot of every checkpoint record, by file name.
    pub fn store_snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        let mut snapshot = BTreeMap::new();
        let Ok(entries) = fs::read_dir(&self.config.state) else {
            return snapshot;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() {
                snapshot.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    fs::read(&path).unwrap(),
                );
            }
        }
        snapshot
    }
}

/// A manifest unit whose single install step appends its name to the trace.
pub fn traced_unit(env: &TestEnv, name: &str, tier: u32) -> String {
    format!(
        r#"
[[unit]]
name = "{name}"
tier = {tier}

[[unit.step]]
phase = "install"
run = "echo {name} >> '{trace}'"
"#,
        name = name,
        tier = tier,
        trace = env.trace_path().display()
    )
}

/// Records mount and unmount calls in order.
#[derive(Clone, Default)]
pub struct RecordingMounter {
    pub events: Arc<Mutex<Vec<String>>>,
    /// Mount target that fails, if any.
    pub fail_target: Option<&'static str>,
}

impl RecordingMounter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, spec: &MountSpec, _target: &Path) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("mount {}", spec.target));
        if self.fail_target == Some(spec.target) {
            bail!("permission denied");
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.events.lock().unwrap().push(format!("umount {}", name));
        Ok(())
    }
}

/// Dependency lister backed by a fixed table keyed by root-relative path.
#[derive(Default)]
pub struct FakeLister {
    pub deps: HashMap<PathBuf, Vec<Dependency>>,
}

impl FakeLister {
    pub fn with(mut self, binary: &str, libs: &[(&str, Option<&str>)]) -> Self {
        self.deps.insert(
            PathBuf::from(binary),
            libs.iter()
                .map(|(name, path)| Dependency {
                    name: name.to_string(),
                    path: path.map(PathBuf::from),
                })
                .collect(),
        );
        self
    }
}

impl DependencyLister for FakeLister {
    fn list(&self, _root: &Path, binary: &Path) -> Result<Vec<Dependency>> {
        let rel = binary.strip_prefix("/").unwrap_or(binary);
        Ok(self.deps.get(rel).cloned().unwrap_or_default())
    }
}

/// Write a file with a fake ELF header and the given mode.
pub fn create_fake_elf(path: &Path, mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    let mut content = b"\x7fELF".to_vec();
    content.extend_from_slice(path.to_string_lossy().as_bytes());
    fs::write(path, content).expect("Failed to write fake ELF");
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("Failed to set mode");
}

/// Assert that a symlink exists and points to the expected target.
pub fn assert_symlink(path: &Path, expected_target: &str) {
    assert!(
        path.is_symlink(),
        "Expected symlink at {}, but it's not a symlink",
        path.display()
    );
    let target = fs::read_link(path).expect("Failed to read symlink");
    assert_eq!(
        target.to_string_lossy(),
        expected_target,
        "Symlink {} points to {:?}, expected {}",
        path.display(),
        target,
        expected_target
    );
}

/// Assert that a path is a regular file (not a symlink).
pub fn assert_regular_file(path: &Path) {
    let meta = fs::symlink_metadata(path)
        .unwrap_or_else(|_| panic!("Expected file to exist: {}", path.display()));
    assert!(
        meta.file_type().is_file(),
        "Expected regular file at {}, found {:?}",
        path.display(),
        meta.file_type()
    );
}
