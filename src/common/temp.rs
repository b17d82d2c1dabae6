//! Utilities for managing temporary work directories.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prepare a work directory, removing it if it exists and creating it fresh.
pub fn prepare_work_dir(parent_dir: &Path, name: &str) -> Result<PathBuf> {
    let work_dir = parent_dir.join(name);

    // Clean up if it exists from a previous (interrupted) run
    if work_dir.exists() {
        fs::remove_dir_all(&work_dir)?;
    }

    fs::create_dir_all(&work_dir)?;

    Ok(work_dir)
}

/// Clean up a work directory after use. Missing directories are fine.
pub fn cleanup_work_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove work directory");
        }
    }
}

/// A fresh work directory that is removed when dropped, on every exit path.
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn create(parent_dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            path: prepare_work_dir(parent_dir, name)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        cleanup_work_dir(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_work_dir_starts_empty() {
        let temp = TempDir::new().unwrap();
        let first = prepare_work_dir(temp.path(), "work").unwrap();
        fs::write(first.join("stale"), "x").unwrap();

        let second = prepare_work_dir(temp.path(), "work").unwrap();
        assert!(!second.join("stale").exists());
    }

    #[test]
    fn test_work_dir_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let work = WorkDir::create(temp.path(), "scratch").unwrap();
            fs::write(work.path().join("obj.o"), "x").unwrap();
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
