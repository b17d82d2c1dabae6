//! Failure taxonomy for the build pipeline.
//!
//! Components return `anyhow::Result` and raise a [`BuildError`] as the root
//! error when the failure belongs to one of these classes. The pipeline driver
//! and the CLI recover the class with [`BuildError::classify`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// An expected source archive, seed binary or artifact input is absent.
    #[error("missing {what}: {}", path.display())]
    MissingInput { what: String, path: PathBuf },

    /// An external build or install step exited non-zero.
    #[error("unit '{unit}' failed in {phase} step (exit code {code})")]
    StepFailure {
        unit: String,
        phase: String,
        code: i32,
        log_excerpt: String,
    },

    /// A mount or unmount inside the sandbox root failed.
    #[error("sandbox operation on {} failed: {message}", target.display())]
    SandboxFailure { target: PathBuf, message: String },

    /// The dynamic linker could not be found anywhere in the tree.
    #[error("dynamic linker '{linker}' not found anywhere in the tree; the image cannot boot")]
    NormalizationInvariantViolation { linker: String },

    /// An image-building tool exited non-zero or produced no output.
    #[error("failed to assemble {artifact}: {message}")]
    AssemblyFailure { artifact: String, message: String },

    /// The operator interrupted the run while this unit or stage was executing.
    #[error("interrupted during '{unit}'")]
    Interrupted { unit: String },
}

impl BuildError {
    pub fn missing(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingInput {
            what: what.into(),
            path: path.into(),
        }
    }

    pub fn assembly(artifact: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AssemblyFailure {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    /// Find the taxonomy class of an error chain, if it has one.
    pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
        err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
    }

    /// Short label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingInput { .. } => "missing input",
            Self::StepFailure { .. } => "step failure",
            Self::SandboxFailure { .. } => "sandbox failure",
            Self::NormalizationInvariantViolation { .. } => "normalization invariant violation",
            Self::AssemblyFailure { .. } => "assembly failure",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}
