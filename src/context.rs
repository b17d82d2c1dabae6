//! Build context shared by the executor and the pipeline driver.
//!
//! The installed tree is one shared mutable resource. It is reached only
//! through this context, which the driver owns and passes down explicitly.

use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::sandbox::{Sandbox, UTILS_IN_ROOT};

pub struct BuildContext<'a> {
    pub config: &'a Config,
    pub checkpoints: &'a CheckpointStore,
    pub sandbox: &'a Sandbox,
}

impl<'a> BuildContext<'a> {
    pub fn new(config: &'a Config, checkpoints: &'a CheckpointStore, sandbox: &'a Sandbox) -> Self {
        Self {
            config,
            checkpoints,
            sandbox,
        }
    }

    /// The installed tree; also the sandbox root.
    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    /// Log directory for one unit.
    pub fn unit_log_dir(&self, unit: &str) -> PathBuf {
        self.config.logs.join(unit)
    }

    /// Map a host path under the root to the path a step sees.
    ///
    /// With chroot disabled steps run on the host, so the host path is kept.
    pub fn step_path(&self, host_path: &Path) -> PathBuf {
        if !self.config.chroot {
            return host_path.to_path_buf();
        }
        match host_path.strip_prefix(self.root()) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => host_path.to_path_buf(),
        }
    }

    /// Staged utilities as seen by a step.
    pub fn utils_path(&self) -> PathBuf {
        self.step_path(&self.root().join(UTILS_IN_ROOT))
    }

    /// Host path of the scratch directory parent.
    pub fn build_dir(&self) -> PathBuf {
        self.sandbox.scratch_parent()
    }
}
