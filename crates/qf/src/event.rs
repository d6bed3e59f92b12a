//! Event and signal primitives.
//!
//! Events are lightweight messages identified by an integral signal plus an
//! optional payload. Queues hold events by value; the payload of a dynamic
//! event is reference counted, so dropping the last holder after dispatch is
//! the garbage-collection step that releases its storage. Publishing hands
//! every subscriber a clone that shares one payload.

use core::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Identifier for a signal.
///
/// Values below [`Signal::USER`] are reserved for the framework.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u16);

impl Signal {
    /// Signal carried by framework-internal timeout time events.
    pub const TIMEOUT: Signal = Signal(1);
    /// First signal available to applications.
    pub const USER: Signal = Signal(4);

    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER.0
    }
}

impl From<u16> for Signal {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG({:#06x})", self.0)
    }
}

/// Metadata shared by all events.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub signal: Signal,
}

impl EventHeader {
    pub const fn new(signal: Signal) -> Self {
        Self { signal }
    }
}

/// Concrete event type with a strongly typed payload.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug)]
pub struct Event<T = ()> {
    pub header: EventHeader,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(signal: Signal, payload: T) -> Self {
        Self {
            header: EventHeader::new(signal),
            payload,
        }
    }

    pub fn signal(&self) -> Signal {
        self.header.signal
    }
}

impl<T: Clone> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header,
            payload: self.payload.clone(),
        }
    }
}

/// Type-erased, shared event payload.
pub type DynPayload = Arc<dyn Any + Send + Sync>;

/// Event envelope carried by the kernel queues.
pub type DynEvent = Event<DynPayload>;

impl Event<DynPayload> {
    pub fn with_arc(signal: Signal, payload: DynPayload) -> Self {
        Self::new(signal, payload)
    }

    pub fn with_payload<T: Any + Send + Sync>(signal: Signal, payload: T) -> Self {
        Self::with_arc(signal, Arc::new(payload))
    }

    pub fn empty_dyn(signal: Signal) -> Self {
        Self::with_arc(signal, Arc::new(()))
    }

    /// Borrows the payload as `T`, if that is what it holds.
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}
