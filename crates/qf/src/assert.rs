//! Fatal assertion channel.
//!
//! Every contract violation detected by the framework or the kernels ends up
//! in [`on_assert`]: the failure is logged, the platform hook installed with
//! [`set_handler`] is notified and the offending context panics. Release
//! profiles are built with `panic = "abort"`, which halts the system at that
//! point.

use std::sync::{PoisonError, RwLock};

use log::error;

/// Platform notification invoked before the system halts.
///
/// Receives the module name and the numeric location id of the failed check.
pub type AssertHandler = fn(module: &'static str, location: u32);

static HANDLER: RwLock<Option<AssertHandler>> = RwLock::new(None);

/// Installs (or clears) the platform assertion hook, returning the old one.
pub fn set_handler(handler: Option<AssertHandler>) -> Option<AssertHandler> {
    let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    core::mem::replace(&mut *slot, handler)
}

/// Reports a failed contract check and never returns.
#[cold]
#[track_caller]
pub fn on_assert(module: &'static str, location: u32) -> ! {
    error!(target: "qf::assert", "assertion failed in {module} at location {location}");

    let handler = *HANDLER.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(handler) = handler {
        handler(module, location);
    }

    panic!("assertion failed in {module} at location {location}");
}

/// Checks a precondition, routing a failure to [`on_assert`].
#[inline]
#[track_caller]
pub fn require(condition: bool, module: &'static str, location: u32) {
    if !condition {
        on_assert(module, location);
    }
}
