//! # qf
//!
//! A clean-room, idiomatic Rust port of the [Quantum Platform Framework
//! (QF)](https://www.state-machine.com/qpcpp/) building blocks shared by the
//! preemptive kernels. The crate targets `x86_64` with the standard library
//! enabled; the kernels in `qk` and `qxk` own the scheduling policy and keep
//! all of the state defined here inside their single critical section.
//!
//! ## Module Overview
//! - [`event`]    – Signal and event primitives.
//! - [`active`]   – Active object behavior contract and dispatch wrapper.
//! - [`queue`]    – Bounded event queue with FIFO/LIFO posting and margins.
//! - [`prio_set`] – Hierarchical ready-priority bitmap.
//! - [`pubsub`]   – Per-signal subscriber lists for publishing.
//! - [`time`]     – Time events and the per-tick-rate timer wheel.
//! - [`config`]   – Kernel sizing and runtime configuration.
//! - [`assert`]   – The fatal assertion channel.
//! - [`sync`]     – Critical-section mutex used by the kernels.

#[cfg(all(not(feature = "std"), not(feature = "lock-free")))]
compile_error!("qf needs either the `std` or the `lock-free` feature");

pub mod active;
pub mod assert;
pub mod config;
pub mod event;
pub mod prio_set;
pub mod pubsub;
pub mod queue;
pub mod sync;
pub mod time;

pub use active::{ActiveBehavior, ActiveContext, ActiveObject, ActiveObjectId};
pub use config::{KernelConfig, KernelConfigBuilder};
pub use event::{DynEvent, DynPayload, Event, EventHeader, Signal};
pub use prio_set::{PrioSet, MAX_PRIO};
pub use pubsub::Subscriptions;
pub use queue::{EventQueue, QueueStats, NO_MARGIN};
pub use time::{Expired, TimeEvent, TimeEventError, TimeEventId, TimerHost, TimerWheel};
