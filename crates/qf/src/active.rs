//! Active object abstraction.
//!
//! An active object couples a behavior (the state machine that interprets
//! events) with a priority and, inside a kernel, a private event queue. The
//! kernels own the queues; this module only defines the dispatch contract.
//! Behaviors are generic over the kernel type `K` so that a handler can post
//! events or take locks through the [`ActiveContext`] it receives.

use crate::event::DynEvent;
use crate::sync::Mutex;

/// Unique identifier for an active object or extended thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActiveObjectId(pub u8);

impl ActiveObjectId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }
}

/// Per-dispatch context passed to behaviors.
pub struct ActiveContext<'a, K: ?Sized> {
    id: ActiveObjectId,
    priority: u8,
    kernel: &'a K,
}

impl<'a, K: ?Sized> ActiveContext<'a, K> {
    pub fn new(id: ActiveObjectId, priority: u8, kernel: &'a K) -> Self {
        Self {
            id,
            priority,
            kernel,
        }
    }

    pub fn id(&self) -> ActiveObjectId {
        self.id
    }

    /// The natural (registered) priority of the object being dispatched.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn kernel(&self) -> &'a K {
        self.kernel
    }
}

/// Trait implemented by application state machines.
///
/// `on_event` runs to completion: it must not call any blocking primitive.
pub trait ActiveBehavior<K: ?Sized>: Send + 'static {
    fn on_start(&mut self, _ctx: &mut ActiveContext<'_, K>) {}
    fn on_event(&mut self, ctx: &mut ActiveContext<'_, K>, event: DynEvent);
}

/// A registered active object: identity, priority and its behavior.
pub struct ActiveObject<K: ?Sized> {
    id: ActiveObjectId,
    priority: u8,
    behavior: Mutex<Box<dyn ActiveBehavior<K>>>,
}

impl<K: ?Sized + 'static> ActiveObject<K> {
    pub fn new<B: ActiveBehavior<K>>(id: ActiveObjectId, priority: u8, behavior: B) -> Self {
        Self {
            id,
            priority,
            behavior: Mutex::new(Box::new(behavior)),
        }
    }

    pub fn id(&self) -> ActiveObjectId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Runs the behavior's start-up hook.
    pub fn start(&self, kernel: &K) {
        let mut ctx = ActiveContext::new(self.id, self.priority, kernel);
        self.behavior.lock().on_start(&mut ctx);
    }

    /// Dispatches one event; the event is dropped (recycled) on return.
    pub fn dispatch(&self, kernel: &K, event: DynEvent) {
        let mut ctx = ActiveContext::new(self.id, self.priority, kernel);
        self.behavior.lock().on_event(&mut ctx, event);
    }
}

impl<K: ?Sized> core::fmt::Debug for ActiveObject<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActiveObject")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}
