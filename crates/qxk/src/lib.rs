//! QXK: dual-mode preemptive kernel.
//!
//! Basic threads are run-to-completion active objects that share a single
//! stack, exactly as in QK. Extended threads own a stack and may block on a
//! [`Semaphore`], a [`CeilingMutex`], their own event queue or a timed
//! delay. Both kinds share one priority space; the highest ready priority
//! always runs.
//!
//! On a hosted target every extended thread is backed by an OS thread and
//! the kernel hands the CPU from one context to the next, so exactly one
//! context executes application code at any time.

pub mod kernel;
pub mod primitives;
pub mod scheduler;
pub mod thread;
mod time;

pub use kernel::{QxkKernel, QxkKernelBuilder, QxkKernelError};
pub use primitives::{CeilingMutex, Semaphore, SyncError, SyncResult};
pub use scheduler::{Context, Occupant, QxkScheduler, SchedStatus, ScheduleMode};
pub use thread::{ThreadConfig, ThreadHandler, XThread, NO_TIMEOUT};
