//! Build unit definitions and the TOML manifest they are loaded from.
//!
//! A manifest lists units in build order. The order in the file is the order
//! the pipeline runs them in; tiers only document (and validate) that order.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle phase of a build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configure,
    Build,
    Test,
    Install,
    /// Outside the lifecycle ordering; may appear anywhere before install.
    Custom,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Install => "install",
            Phase::Custom => "custom",
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Phase::Configure => Some(0),
            Phase::Build => Some(1),
            Phase::Test => Some(2),
            Phase::Install => Some(3),
            Phase::Custom => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One opaque build action.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub phase: Phase,
    /// Shell script body.
    pub run: String,
    /// Only honored for `test` steps.
    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildUnit {
    pub name: String,
    pub tier: u32,
    /// Archive file name inside the sources directory.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub non_fatal: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

impl BuildUnit {
    /// Absolute path of this unit's source archive, if it has one.
    pub fn source_path(&self, sources_dir: &Path) -> Option<PathBuf> {
        self.source.as_ref().map(|s| sources_dir.join(s))
    }

    /// Check the structural rules a unit must satisfy before it is run.
    pub fn validate(&self) -> Result<()> {
        validate_unit_name(&self.name)?;

        if self.steps.is_empty() {
            bail!("unit '{}' has no steps", self.name);
        }

        let mut last_rank = 0u8;
        let mut install_seen = false;
        for step in &self.steps {
            if install_seen {
                bail!(
                    "unit '{}': '{}' step after install; install must be the last step",
                    self.name,
                    step.phase
                );
            }
            if let Some(rank) = step.phase.rank() {
                if rank < last_rank {
                    bail!(
                        "unit '{}': '{}' step appears after a later lifecycle phase",
                        self.name,
                        step.phase
                    );
                }
                last_rank = rank;
            }
            if step.phase == Phase::Install {
                install_seen = true;
            }
            if step.allow_failure && step.phase != Phase::Test {
                bail!(
                    "unit '{}': allow_failure is only permitted on test steps",
                    self.name
                );
            }
        }

        if !install_seen {
            bail!("unit '{}' has no install step", self.name);
        }

        Ok(())
    }
}

/// Reject names that could escape the state or scratch directories.
pub fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        bail!("invalid unit name '{}'", name);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(rename = "unit", default)]
    units: Vec<BuildUnit>,
}

/// Parse and validate a manifest from TOML text.
pub fn parse_manifest(content: &str) -> Result<Vec<BuildUnit>> {
    let manifest: Manifest = toml::from_str(content).context("Failed to parse unit manifest")?;

    let mut seen = HashSet::new();
    let mut last_tier = 0u32;
    for unit in &manifest.units {
        unit.validate()?;
        if !seen.insert(unit.name.as_str()) {
            bail!("duplicate unit name '{}'", unit.name);
        }
        if unit.tier < last_tier {
            bail!(
                "unit '{}' is in tier {} but follows a tier {} unit; list units in tier order",
                unit.name,
                unit.tier,
                last_tier
            );
        }
        last_tier = unit.tier;
    }

    Ok(manifest.units)
}

/// Load the manifest at `path`.
pub fn load_manifest(path: &Path) -> Result<Vec<BuildUnit>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read unit manifest {}", path.display()))?;
    parse_manifest(&content).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[unit]]
name = "zlib"
tier = 1
source = "zlib-1.3.1.tar.xz"
[unit.env]
CFLAGS = "-O2"
[[unit.step]]
phase = "configure"
run = "./configure --prefix=/usr"
[[unit.step]]
phase = "build"
run = "make"
[[unit.step]]
phase = "test"
run = "make check"
allow_failure = true
[[unit.step]]
phase = "install"
run = "make install"
"#;

    #[test]
    fn test_parse_manifest() {
        let units = parse_manifest(MANIFEST).unwrap();
        assert_eq!(units.len(), 1);

        let zlib = &units[0];
        assert_eq!(zlib.name, "zlib");
        assert_eq!(zlib.tier, 1);
        assert_eq!(zlib.steps.len(), 4);
        assert_eq!(zlib.steps[2].phase, Phase::Test);
        assert!(zlib.steps[2].allow_failure);
        assert_eq!(zlib.env.get("CFLAGS").map(String::as_str), Some("-O2"));
        assert_eq!(
            zlib.source_path(Path::new("/sources")),
            Some(PathBuf::from("/sources/zlib-1.3.1.tar.xz"))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml = MANIFEST.replace("tier = 1", "tier = 1\nflavour = \"spicy\"");
        assert!(parse_manifest(&toml).is_err());
    }

    #[test]
    fn test_missing_install_rejected() {
        let toml = r#"
[[unit]]
name = "a"
tier = 0
[[unit.step]]
phase = "build"
run = "true"
"#;
        let err = parse_manifest(toml).unwrap_err();
        assert!(format!("{:#}", err).contains("no install step"));
    }

    #[test]
    fn test_step_after_install_rejected() {
        let toml = r#"
[[unit]]
name = "a"
tier = 0
[[unit.step]]
phase = "install"
run = "true"
[[unit.step]]
phase = "custom"
run = "true"
"#;
        assert!(parse_manifest(toml).is_err());
    }

    #[test]
    fn test_out_of_order_phases_rejected() {
        let toml = r#"
[[unit]]
name = "a"
tier = 0
[[unit.step]]
phase = "build"
run = "make"
[[unit.step]]
phase = "configure"
run = "./configure"
[[unit.step]]
phase = "install"
run = "make install"
"#;
        assert!(parse_manifest(toml).is_err());
    }

    #[test]
    fn test_duplicate_and_tier_order() {
        let dup = r#"
[[unit]]
name = "a"
tier = 0
[[unit.step]]
phase = "install"
run = "true"
[[unit]]
name = "a"
tier = 0
[[unit.step]]
phase = "install"
run = "true"
"#;
        assert!(format!("{:#}", parse_manifest(dup).unwrap_err()).contains("duplicate"));

        let tiers = dup.replacen("name = \"a\"\ntier = 0", "name = \"b\"\ntier = 2", 1);
        assert!(format!("{:#}", parse_manifest(&tiers).unwrap_err()).contains("tier order"));
    }

    #[test]
    fn test_validate_unit_name() {
        assert!(validate_unit_name("glibc").is_ok());
        assert!(validate_unit_name("gtk+-3").is_ok());
        assert!(validate_unit_name("").is_err());
        assert!(validate_unit_name("../etc").is_err());
        assert!(validate_unit_name(".hidden").is_err());
        assert!(validate_unit_name("a/b").is_err());
    }
}
