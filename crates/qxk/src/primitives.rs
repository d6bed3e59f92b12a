//! Blocking synchronization primitives for extended threads.
//!
//! Both primitives keep a priority-ordered wait list; the highest waiting
//! thread is always served first. A thread that gives up on a timeout is
//! taken off the list by the kernel's tick processing.

use std::fmt;
use std::sync::Arc;

use log::trace;
use qf::assert::{on_assert, require};
use qf::sync::Mutex;
use qf::{PrioSet, MAX_PRIO};
use thiserror::Error;

use crate::kernel::{KernelState, QxkKernel};
use crate::scheduler::Occupant;
use crate::thread::{Blocker, WaitSet};

const SEMA: &str = "qxk_sema";
const MUTEX: &str = "qxk_mutex";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("timed out")]
    Timeout,
    #[error("semaphore already at its maximum count")]
    Overflow,
    #[error("wait canceled")]
    Canceled,
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug)]
struct SemState {
    count: u16,
    max_count: u16,
    waiters: PrioSet,
}

struct SemaphoreCore {
    state: Mutex<SemState>,
}

impl WaitSet for SemaphoreCore {
    fn remove_waiter(&self, prio: u8) {
        self.state.lock().waiters.remove(prio);
    }
}

/// Counting semaphore bounded by `max_count`.
#[derive(Clone)]
pub struct Semaphore {
    core: Arc<SemaphoreCore>,
}

impl Semaphore {
    pub fn new(count: u16, max_count: u16) -> Self {
        require(max_count > 0 && count <= max_count, SEMA, 100);
        Self {
            core: Arc::new(SemaphoreCore {
                state: Mutex::new(SemState {
                    count,
                    max_count,
                    waiters: PrioSet::new(),
                }),
            }),
        }
    }

    pub fn count(&self) -> u16 {
        self.core.state.lock().count
    }

    /// Takes one unit, blocking the calling extended thread up to `n_ticks`
    /// when none is available.
    pub fn wait(&self, kernel: &QxkKernel, n_ticks: u32) -> SyncResult<()> {
        let state = kernel.state.lock();
        let index = state.blocking_thread();
        {
            let mut sem = self.core.state.lock();
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(());
            }
            sem.waiters.insert(state.threads[index].prio);
        }

        let waits: Arc<dyn WaitSet> = self.core.clone();
        let (_state, timed_out) = kernel.block_current(state, index, Blocker::Object(waits), n_ticks);
        if timed_out {
            Err(SyncError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Takes one unit if available. Never blocks.
    pub fn try_wait(&self, kernel: &QxkKernel) -> bool {
        let _state = kernel.state.lock();
        let mut sem = self.core.state.lock();
        if sem.count > 0 {
            sem.count -= 1;
            true
        } else {
            false
        }
    }

    /// Releases one unit. The highest-priority waiter, if any, consumes it
    /// directly; otherwise the count grows. Callable from any context.
    pub fn signal(&self, kernel: &QxkKernel) -> SyncResult<()> {
        let mut state = kernel.state.lock();
        let woken = {
            let mut sem = self.core.state.lock();
            if sem.count >= sem.max_count {
                return Err(SyncError::Overflow);
            }
            match sem.waiters.find_max() {
                Some(prio) => {
                    sem.waiters.remove(prio);
                    Some(prio)
                }
                None => {
                    sem.count += 1;
                    None
                }
            }
        };

        if let Some(prio) = woken {
            let index = state.sched.thread_at(prio);
            state.unblock(index);
            trace!(target: "qxk::sema", "signal wakes prio={prio}");
            if !state.sched.in_isr() {
                drop(kernel.schedule(state));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sem = self.core.state.lock();
        f.debug_struct("Semaphore")
            .field("count", &sem.count)
            .field("max_count", &sem.max_count)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Basic(usize),
    Thread(usize),
}

impl Holder {
    fn occupant(self) -> Occupant {
        match self {
            Self::Basic(index) => Occupant::Basic(index),
            Self::Thread(index) => Occupant::Thread(index),
        }
    }

    fn prio(self, state: &KernelState) -> u8 {
        match self {
            Self::Basic(index) => state.ao_prio[index],
            Self::Thread(index) => state.threads[index].prio,
        }
    }

    /// Moves the holder, and its ready bit, to `to`.
    fn move_to(self, state: &mut KernelState, to: u8) {
        let from = self.prio(state);
        state.sched.move_ready(from, to);
        match self {
            Self::Basic(index) => {
                state.ao_prio[index] = to;
                state.sched.set_active(to);
            }
            Self::Thread(index) => state.threads[index].prio = to,
        }
    }
}

#[derive(Debug)]
struct MutexState {
    holder: Option<Holder>,
    nest: u8,
    saved_prio: u8,
    waiters: PrioSet,
}

impl MutexState {
    fn acquire(&mut self, state: &mut KernelState, holder: Holder, ceiling: u8) {
        self.holder = Some(holder);
        self.nest = 1;
        self.saved_prio = holder.prio(state);
        if ceiling != 0 {
            // the ceiling level must have been reserved at registration
            require(state.sched.occupant(ceiling) == Occupant::Reserved, MUTEX, 230);
            state.sched.set_occupant(ceiling, holder.occupant());
            holder.move_to(state, ceiling);
        }
        trace!(target: "qxk::mutex", "{holder:?} acquires ceiling {ceiling}");
    }
}

struct MutexCore {
    ceiling: u8,
    state: Mutex<MutexState>,
}

impl WaitSet for MutexCore {
    fn remove_waiter(&self, prio: u8) {
        self.state.lock().waiters.remove(prio);
    }
}

/// Recursive priority-ceiling mutex.
///
/// While held, the holder runs at the ceiling priority, which must be
/// reserved with [`QxkKernelBuilder::register_mutex`](crate::QxkKernelBuilder::register_mutex).
/// A zero ceiling disables the priority boost.
#[derive(Clone)]
pub struct CeilingMutex {
    core: Arc<MutexCore>,
}

impl CeilingMutex {
    pub fn new(ceiling: u8) -> Self {
        require(ceiling <= MAX_PRIO, MUTEX, 100);
        Self {
            core: Arc::new(MutexCore {
                ceiling,
                state: Mutex::new(MutexState {
                    holder: None,
                    nest: 0,
                    saved_prio: 0,
                    waiters: PrioSet::new(),
                }),
            }),
        }
    }

    pub fn ceiling(&self) -> u8 {
        self.core.ceiling
    }

    pub fn is_held(&self) -> bool {
        self.core.state.lock().holder.is_some()
    }

    pub fn nesting(&self) -> u8 {
        self.core.state.lock().nest
    }

    /// Locks on behalf of the calling extended thread, blocking up to
    /// `n_ticks` while another context holds the mutex.
    pub fn lock(&self, kernel: &QxkKernel, n_ticks: u32) -> SyncResult<()> {
        let mut state = kernel.state.lock();
        let index = state.blocking_thread();
        let me = Holder::Thread(index);
        let ceiling = self.core.ceiling;
        let mut inner = self.core.state.lock();

        let holder = inner.holder;
        match holder {
            None => {
                require(ceiling == 0 || me.prio(&state) < ceiling, MUTEX, 220);
                inner.acquire(&mut state, me, ceiling);
                Ok(())
            }
            Some(holder) if holder == me => {
                require(inner.nest < u8::MAX, MUTEX, 240);
                inner.nest += 1;
                Ok(())
            }
            Some(_) => {
                require(ceiling == 0 || me.prio(&state) < ceiling, MUTEX, 220);
                inner.waiters.insert(me.prio(&state));
                drop(inner);

                let waits: Arc<dyn WaitSet> = self.core.clone();
                let (_state, timed_out) =
                    kernel.block_current(state, index, Blocker::Object(waits), n_ticks);
                if timed_out {
                    Err(SyncError::Timeout)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Locks without blocking; usable from basic and extended threads.
    pub fn try_lock(&self, kernel: &QxkKernel) -> bool {
        let mut state = kernel.state.lock();
        let me = caller(&state);
        require(state.sched.lock_holder() != me.prio(&state), MUTEX, 250);
        let ceiling = self.core.ceiling;
        let mut inner = self.core.state.lock();

        let holder = inner.holder;
        match holder {
            None => {
                require(ceiling == 0 || me.prio(&state) < ceiling, MUTEX, 220);
                inner.acquire(&mut state, me, ceiling);
                true
            }
            Some(holder) if holder == me => {
                require(inner.nest < u8::MAX, MUTEX, 240);
                inner.nest += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Releases one level of nesting. The outermost release restores the
    /// holder's priority and hands the mutex to the highest waiter.
    pub fn unlock(&self, kernel: &QxkKernel) {
        let mut state = kernel.state.lock();
        let me = caller(&state);
        // the scheduler lock taken after the mutex must be released first
        require(state.sched.lock_holder() != me.prio(&state), MUTEX, 310);
        let ceiling = self.core.ceiling;
        let mut inner = self.core.state.lock();

        require(inner.holder == Some(me), MUTEX, 300);
        if inner.nest > 1 {
            inner.nest -= 1;
            return;
        }

        if ceiling != 0 {
            me.move_to(&mut state, inner.saved_prio);
            state.sched.set_occupant(ceiling, Occupant::Reserved);
        }
        match inner.waiters.find_max() {
            Some(prio) => {
                inner.waiters.remove(prio);
                let index = state.sched.thread_at(prio);
                inner.acquire(&mut state, Holder::Thread(index), ceiling);
                state.unblock(index);
            }
            None => {
                inner.holder = None;
                inner.nest = 0;
            }
        }
        drop(inner);
        drop(kernel.schedule(state));
    }
}

impl fmt::Debug for CeilingMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.state.lock();
        f.debug_struct("CeilingMutex")
            .field("ceiling", &self.core.ceiling)
            .field("holder", &inner.holder)
            .field("nest", &inner.nest)
            .finish()
    }
}

/// The context calling a mutex operation.
fn caller(state: &KernelState) -> Holder {
    require(!state.sched.in_isr(), MUTEX, 200);
    if let Some(index) = state.sched.current() {
        return Holder::Thread(index);
    }
    match state.sched.occupant(state.sched.active_priority()) {
        Occupant::Basic(index) => Holder::Basic(index),
        _ => on_assert(MUTEX, 210),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qf::{ActiveBehavior, ActiveContext, ActiveObjectId, DynEvent, Signal};
    use std::sync::Mutex as StdMutex;

    const HOLDER: ActiveObjectId = ActiveObjectId::new(1);
    const PEER: ActiveObjectId = ActiveObjectId::new(2);

    struct Locker {
        mutex: CeilingMutex,
        seen: Arc<StdMutex<Vec<(u8, bool)>>>,
    }

    impl ActiveBehavior<QxkKernel> for Locker {
        fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
            let kernel = ctx.kernel();
            let locked = self.mutex.try_lock(kernel);
            self.seen.lock().unwrap().push((kernel.current_priority(), locked));
            kernel.post(PEER, DynEvent::empty_dyn(Signal(40)));
            self.seen.lock().unwrap().push((kernel.current_priority(), false));
            self.mutex.unlock(kernel);
        }
    }

    struct Peer {
        seen: Arc<StdMutex<Vec<(u8, bool)>>>,
    }

    impl ActiveBehavior<QxkKernel> for Peer {
        fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
            self.seen.lock().unwrap().push((ctx.priority(), true));
        }
    }

    #[test]
    fn semaphore_counts_without_blocking() {
        let kernel = QxkKernel::builder().build();
        kernel.start();
        let sem = Semaphore::new(1, 2);

        assert!(sem.try_wait(&kernel));
        assert!(!sem.try_wait(&kernel));
        assert_eq!(sem.signal(&kernel), Ok(()));
        assert_eq!(sem.signal(&kernel), Ok(()));
        assert_eq!(sem.signal(&kernel), Err(SyncError::Overflow));
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn basic_try_lock_raises_to_ceiling() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mutex = CeilingMutex::new(9);
        let kernel = QxkKernel::builder()
            .register_ao(
                HOLDER,
                2,
                4,
                Locker {
                    mutex: mutex.clone(),
                    seen: Arc::clone(&seen),
                },
            )
            .unwrap()
            .register_ao(PEER, 5, 4, Peer { seen: Arc::clone(&seen) })
            .unwrap()
            .register_mutex(&mutex)
            .unwrap()
            .build();
        kernel.start();

        kernel.post(HOLDER, DynEvent::empty_dyn(Signal(41)));
        // the peer only runs once the holder drops back below it
        assert_eq!(*seen.lock().unwrap(), vec![(9, true), (9, false), (5, true)]);
        assert!(!mutex.is_held());
        assert_eq!(kernel.current_priority(), 0);
    }

    #[test]
    #[should_panic(expected = "assertion failed in qxk_mutex at location 300")]
    fn unlock_without_holding_faults() {
        struct Unlocker(CeilingMutex);
        impl ActiveBehavior<QxkKernel> for Unlocker {
            fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
                self.0.unlock(ctx.kernel());
            }
        }
        let kernel = QxkKernel::builder()
            .register_ao(HOLDER, 2, 4, Unlocker(CeilingMutex::new(0)))
            .unwrap()
            .build();
        kernel.start();
        kernel.post(HOLDER, DynEvent::empty_dyn(Signal(42)));
    }

    #[test]
    #[should_panic(expected = "assertion failed in qxk_mutex at location 230")]
    fn unregistered_ceiling_faults() {
        struct Grabber(CeilingMutex);
        impl ActiveBehavior<QxkKernel> for Grabber {
            fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
                self.0.try_lock(ctx.kernel());
            }
        }
        let kernel = QxkKernel::builder()
            .register_ao(HOLDER, 2, 4, Grabber(CeilingMutex::new(7)))
            .unwrap()
            .build();
        kernel.start();
        kernel.post(HOLDER, DynEvent::empty_dyn(Signal(43)));
    }

    #[test]
    #[should_panic(expected = "assertion failed in qxk_mutex at location 250")]
    fn try_lock_under_scheduler_lock_faults() {
        struct Grabber(CeilingMutex);
        impl ActiveBehavior<QxkKernel> for Grabber {
            fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
                let kernel = ctx.kernel();
                let _status = kernel.sched_lock(4);
                self.0.try_lock(kernel);
            }
        }
        let kernel = QxkKernel::builder()
            .register_ao(HOLDER, 2, 4, Grabber(CeilingMutex::new(0)))
            .unwrap()
            .build();
        kernel.start();
        kernel.post(HOLDER, DynEvent::empty_dyn(Signal(44)));
    }

    #[test]
    #[should_panic(expected = "assertion failed in qxk_mutex at location 310")]
    fn release_inside_scheduler_lock_faults() {
        struct Releaser(CeilingMutex);
        impl ActiveBehavior<QxkKernel> for Releaser {
            fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
                let kernel = ctx.kernel();
                assert!(self.0.try_lock(kernel));
                let _status = kernel.sched_lock(4);
                self.0.unlock(kernel);
            }
        }
        let kernel = QxkKernel::builder()
            .register_ao(HOLDER, 2, 4, Releaser(CeilingMutex::new(0)))
            .unwrap()
            .build();
        kernel.start();
        kernel.post(HOLDER, DynEvent::empty_dyn(Signal(45)));
    }
}
