//! Status command - checkpoint state per unit.

use anyhow::Result;

use crate::checkpoint::{fingerprint_file, CheckpointState, CheckpointStore};
use crate::config::Config;
use crate::unit::load_manifest;

pub fn cmd_status(config: &Config) -> Result<()> {
    let units = load_manifest(&config.units)?;
    let store = CheckpointStore::open(&config.state);

    println!("=== Unit Status ===\n");
    let mut complete = 0;

    for unit in &units {
        let fingerprint = match unit.source_path(&config.sources) {
            Some(path) if path.is_file() => Some(fingerprint_file(&path)?),
            Some(_) => {
                println!("  [MISSING] {} (source archive not found)", unit.name);
                continue;
            }
            None => None,
        };

        match store.state(&unit.name, fingerprint.as_deref()) {
            CheckpointState::Complete => {
                complete += 1;
                println!("  [DONE]    {} (tier {})", unit.name, unit.tier);
            }
            CheckpointState::Stale { .. } => {
                println!("  [STALE]   {} (source archive changed)", unit.name);
            }
            CheckpointState::Pending => {
                println!("  [PENDING] {}", unit.name);
            }
        }
    }

    println!("\n{}/{} units complete", complete, units.len());
    Ok(())
}
