//! Operator interrupt handling.
//!
//! SIGINT/SIGTERM only set a flag. The executor and the pipeline driver poll
//! it between steps, the image stages between stages and per file, and all of
//! them unwind with [`BuildError::Interrupted`], so the sandbox guard's
//! teardown runs before the process exits. Supervised children are killed
//! with their process group (see [`Cmd::interruptible`]).
//!
//! [`Cmd::interruptible`]: crate::process::Cmd::interruptible
//!
//! [`BuildError::Interrupted`]: crate::error::BuildError::Interrupted

use anyhow::{Context, Result};

use crate::error::BuildError;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT and SIGTERM handlers.
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only touches an atomic.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {:?} handler", signal))?;
    }
    Ok(())
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with [`BuildError::Interrupted`] if an interrupt is pending.
pub fn check(during: &str) -> Result<()> {
    if is_interrupted() {
        return Err(BuildError::Interrupted {
            unit: during.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Raise the flag without a signal.
pub fn request() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}
