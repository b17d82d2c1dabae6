//! Show command - displays information.

use anyhow::Result;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show recorded checkpoints
    Checkpoints,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Checkpoints => {
            let store = CheckpointStore::open(&config.state);
            let records = store.records()?;
            if records.is_empty() {
                println!("No checkpoints in {}", store.dir().display());
            }
            for record in records {
                println!(
                    "  {} completed_at={} fingerprint={}",
                    record.unit,
                    record.completed_at_unix,
                    record.fingerprint.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
