//! Extended thread support for QXK.
//!
//! Extended threads are traditional blocking threads with their own stacks,
//! unlike active objects which are non-blocking and event-driven.
//!
//! Extended threads can:
//! - Block on semaphores, ceiling mutexes and their own event queue
//! - Delay themselves for a number of clock ticks
//! - Have configurable stack sizes
//! - Share the priority space with active objects

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use qf::{ActiveObjectId, DynEvent, EventQueue, TimeEventId};

use crate::kernel::QxkKernel;
use crate::primitives::{SyncError, SyncResult};

/// Tick count meaning "block without a timeout".
pub const NO_TIMEOUT: u32 = 0;

/// Smallest host stack handed to an extended thread's OS thread.
pub(crate) const MIN_HOST_STACK: usize = 64 * 1024;

/// Extended thread body. Returning from it terminates the thread.
pub type ThreadHandler = Box<dyn FnOnce(&XThread) + Send>;

/// Configuration for creating an extended thread.
pub struct ThreadConfig {
    pub id: ActiveObjectId,
    pub priority: u8,
    /// Private event queue length; 0 means the thread has no queue.
    pub queue_len: u16,
    pub stack_size: usize,
    /// Tick rate driving the thread's timeouts.
    pub tick_rate: u8,
    pub handler: ThreadHandler,
}

impl ThreadConfig {
    pub fn new<F>(id: ActiveObjectId, priority: u8, handler: F) -> Self
    where
        F: FnOnce(&XThread) + Send + 'static,
    {
        Self {
            id,
            priority,
            queue_len: 0,
            stack_size: 4096,
            tick_rate: 0,
            handler: Box::new(handler),
        }
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn with_queue(mut self, len: u16) -> Self {
        self.queue_len = len;
        self
    }

    pub fn with_tick_rate(mut self, rate: u8) -> Self {
        self.tick_rate = rate;
        self
    }
}

impl fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("queue_len", &self.queue_len)
            .field("stack_size", &self.stack_size)
            .field("tick_rate", &self.tick_rate)
            .finish()
    }
}

/// Handle passed to a running extended thread.
pub struct XThread {
    kernel: Arc<QxkKernel>,
    index: usize,
}

impl XThread {
    pub(crate) fn new(kernel: Arc<QxkKernel>, index: usize) -> Self {
        Self { kernel, index }
    }

    pub fn id(&self) -> ActiveObjectId {
        self.kernel.thread_id(self.index)
    }

    /// Current priority, which a held ceiling mutex may have raised.
    pub fn priority(&self) -> u8 {
        self.kernel.thread_priority(self.index)
    }

    pub fn kernel(&self) -> &QxkKernel {
        &self.kernel
    }

    /// Blocks for `n_ticks` clock ticks of the thread's tick rate.
    ///
    /// Returns [`SyncError::Canceled`] when another context ended the delay
    /// early through [`QxkKernel::delay_cancel`].
    pub fn delay(&self, n_ticks: u32) -> SyncResult<()> {
        if self.kernel.delay(self.index, n_ticks) {
            Ok(())
        } else {
            Err(SyncError::Canceled)
        }
    }

    /// Takes the next event from the thread's queue, blocking up to
    /// `n_ticks` (or forever with [`NO_TIMEOUT`]). `None` means timeout.
    pub fn queue_get(&self, n_ticks: u32) -> Option<DynEvent> {
        self.kernel.queue_get(self.index, n_ticks)
    }
}

impl fmt::Debug for XThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XThread")
            .field("id", &self.id())
            .field("priority", &self.priority())
            .finish()
    }
}

/// Object whose wait list a blocked thread sits on.
pub(crate) trait WaitSet: Send + Sync {
    /// Forgets the waiter at `prio` after its timeout expired.
    fn remove_waiter(&self, prio: u8);
}

/// What an extended thread is blocked on.
#[derive(Default)]
pub(crate) enum Blocker {
    #[default]
    Running,
    Delay,
    Queue,
    Object(Arc<dyn WaitSet>),
}

impl Blocker {
    pub(crate) fn is_blocked(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("Running"),
            Self::Delay => f.write_str("Delay"),
            Self::Queue => f.write_str("Queue"),
            Self::Object(_) => f.write_str("Object"),
        }
    }
}

/// Mutable per-thread kernel data, guarded by the kernel state lock.
#[derive(Debug)]
pub(crate) struct ThreadControl {
    pub(crate) start_prio: u8,
    pub(crate) prio: u8,
    pub(crate) queue: Option<EventQueue>,
    pub(crate) blocked: Blocker,
    pub(crate) timeout: TimeEventId,
    pub(crate) timed_out: bool,
    pub(crate) terminated: bool,
}

impl ThreadControl {
    pub(crate) fn new(prio: u8, queue_len: u16, timeout: TimeEventId) -> Self {
        Self {
            start_prio: prio,
            prio,
            queue: (queue_len != 0).then(|| EventQueue::new(queue_len)),
            blocked: Blocker::Running,
            timeout,
            timed_out: false,
            terminated: false,
        }
    }
}

/// One-shot latch a context parks on until another context hands it the
/// CPU.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
        *open = false;
    }
}
