//! rootforge - builds a root filesystem from source units and assembles
//! bootable images from it.
//!
//! The pipeline driver runs build units in order inside a sandboxed root,
//! checkpointing each completed unit so an interrupted or failed run resumes
//! where it stopped. The finished tree is then normalized, hardened, reduced
//! to a bootstrap closure and packed into a root image, a bootstrap archive
//! and bootable media.

pub mod artifact;
pub mod checkpoint;
pub mod closure;
pub mod commands;
pub mod common;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod harden;
pub mod interrupt;
pub mod normalize;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod sandbox;
pub mod timing;
pub mod unit;

pub use error::BuildError;
