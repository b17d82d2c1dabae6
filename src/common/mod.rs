//! Shared utilities across rootforge modules.

pub mod binary;
pub mod files;
pub mod fsentry;
pub mod temp;

pub use files::{tail_lines, write_file_mode, write_file_with_dirs};
pub use fsentry::{classify, resolve_in_root, PathKind};
pub use temp::{cleanup_work_dir, prepare_work_dir, WorkDir};
