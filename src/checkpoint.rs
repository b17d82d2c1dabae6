//! Checkpoint store - durable proof that a build unit completed.
//!
//! One JSON record per unit under the state directory. A record exists iff
//! the unit's install step finished; records are only ever written through a
//! temp file + fsync + rename, so a crash never leaves a half-written record.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::unit::validate_unit_name;

/// On-disk checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub unit: String,
    /// sha256 of the source archive at the time the unit completed.
    pub fingerprint: Option<String>,
    pub completed_at_unix: u64,
}

/// State of a unit as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointState {
    Pending,
    Complete,
    /// A record exists but for a different source archive.
    Stale { recorded: Option<String> },
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at `dir`. Nothing is created until the first write.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, unit: &str) -> PathBuf {
        self.dir.join(format!("{}.json", unit))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir.join(".tmp")
    }

    fn read(&self, unit: &str) -> Option<Checkpoint> {
        let path = self.record_path(unit);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, treating as pending");
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, treating as pending");
                None
            }
        }
    }

    /// Classify a unit against the current source fingerprint. No side effects.
    pub fn state(&self, unit: &str, fingerprint: Option<&str>) -> CheckpointState {
        match self.read(unit) {
            None => CheckpointState::Pending,
            Some(cp) => match fingerprint {
                Some(current) if cp.fingerprint.as_deref() != Some(current) => {
                    CheckpointState::Stale {
                        recorded: cp.fingerprint,
                    }
                }
                _ => CheckpointState::Complete,
            },
        }
    }

    /// True if the unit has a checkpoint matching `fingerprint`.
    ///
    /// With `fingerprint == None` any record counts as complete.
    pub fn is_complete(&self, unit: &str, fingerprint: Option<&str>) -> bool {
        self.state(unit, fingerprint) == CheckpointState::Complete
    }

    /// Durably record that `unit` completed.
    pub fn mark_complete(&self, unit: &str, fingerprint: Option<&str>) -> Result<()> {
        validate_unit_name(unit)?;

        let record = Checkpoint {
            unit: unit.to_string(),
            fingerprint: fingerprint.map(str::to_string),
            completed_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
        let tmp = tmp_dir.join(format!("{}.json.{}", unit, std::process::id()));

        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        }

        let dest = self.record_path(unit);
        fs::rename(&tmp, &dest).with_context(|| {
            format!("Failed to move {} to {}", tmp.display(), dest.display())
        })?;

        // Persist the rename itself.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        debug!(unit, fingerprint = ?fingerprint, "checkpoint written");
        Ok(())
    }

    /// Remove a unit's checkpoint. Returns true if one existed.
    pub fn invalidate(&self, unit: &str) -> Result<bool> {
        validate_unit_name(unit)?;
        let path = self.record_path(unit);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Remove every checkpoint. Returns how many were removed.
    pub fn invalidate_all(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.records()? {
            if self.invalidate(&record.unit)? {
                removed += 1;
            }
        }
        let _ = fs::remove_dir_all(self.tmp_dir());
        Ok(removed)
    }

    /// All readable checkpoint records, sorted by unit name.
    pub fn records(&self) -> Result<Vec<Checkpoint>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.dir.display()))
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(unit) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(cp) = self.read(unit) {
                records.push(cp);
            }
        }
        records.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(records)
    }
}

/// sha256 of a file, streamed.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
