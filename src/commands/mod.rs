//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Full build, or the unit pipeline alone
//! - `stages` - normalize / harden / closure / image
//! - `status` - Checkpoint state per unit
//! - `invalidate` - Force units to rebuild
//! - `clean` - Remove build outputs
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod invalidate;
mod preflight;
pub mod show;
pub mod stages;
mod status;

pub use build::{cmd_build, cmd_units, BuildOptions};
pub use clean::{cmd_clean, CleanTarget};
pub use invalidate::cmd_invalidate;
pub use preflight::cmd_preflight;
pub use show::{cmd_show, ShowTarget};
pub use stages::{cmd_closure, cmd_harden, cmd_image, cmd_normalize};
pub use status::cmd_status;
