//! # qk - preemptive run-to-completion kernel
//!
//! Every active object is a *basic thread*: it has no private stack and each
//! activation is exactly one dispatch call. Posting an event to an object
//! whose priority is above both the running priority and the scheduler lock
//! ceiling activates it synchronously, on the poster's stack, so preemption
//! nests like interrupts do.
//!
//! ## Module Overview
//! - [`scheduler`] – Ready set, active priority and scheduler lock bookkeeping.
//! - [`kernel`]    – Registration, posting, the activation loop and the ISR wrapper.
//! - [`mutex`]     – Priority-ceiling mutex built on the scheduler lock.
//! - [`time`]      – Clock tick processing for the kernel's timer wheel.

pub mod kernel;
pub mod mutex;
pub mod scheduler;
mod time;

pub use kernel::{QkKernel, QkKernelBuilder, QkKernelError};
pub use mutex::QkMutex;
pub use scheduler::{QkScheduler, SchedStatus};
