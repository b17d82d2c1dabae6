//! Invalidate command - drops checkpoints so units rebuild.

use anyhow::{bail, Result};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::unit::validate_unit_name;

pub fn cmd_invalidate(config: &Config, units: &[String], all: bool) -> Result<()> {
    let store = CheckpointStore::open(&config.state);

    if all {
        let removed = store.invalidate_all()?;
        println!("Removed {} checkpoints.", removed);
        return Ok(());
    }
    if units.is_empty() {
        bail!("Name at least one unit, or pass --all");
    }

    for unit in units {
        validate_unit_name(unit)?;
        if store.invalidate(unit)? {
            println!("  {} will be rebuilt", unit);
        } else {
            println!("  {} had no checkpoint", unit);
        }
    }
    Ok(())
}
