//! QK kernel: registration, posting and the activation loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use qf::assert::{on_assert, require};
use qf::sync::{Mutex, MutexGuard};
use qf::{
    ActiveBehavior, ActiveObject, ActiveObjectId, DynEvent, EventQueue, KernelConfig, QueueStats,
    Signal, Subscriptions, TimerWheel, NO_MARGIN,
};
use thiserror::Error;

use crate::scheduler::{QkScheduler, SchedStatus};

const MODULE: &str = "qk";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QkKernelError {
    #[error("active object priority {0} already registered")]
    DuplicatePriority(u8),
    #[error("active object {0:?} already registered")]
    DuplicateId(ActiveObjectId),
    #[error("invalid priority {priority}: {reason}")]
    InvalidPriority { priority: u8, reason: &'static str },
    #[error("active object {0:?} needs a non-empty event queue")]
    ZeroCapacity(ActiveObjectId),
}

struct Registration {
    object: ActiveObject<QkKernel>,
    queue_len: u16,
}

pub struct QkKernelBuilder {
    config: KernelConfig,
    registrations: Vec<Registration>,
}

impl Default for QkKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QkKernelBuilder {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            config,
            registrations: Vec::new(),
        }
    }

    /// Registers an active object at a unique `priority` with a queue of
    /// `queue_len` events.
    pub fn register<B: ActiveBehavior<QkKernel>>(
        mut self,
        id: ActiveObjectId,
        priority: u8,
        queue_len: u16,
        behavior: B,
    ) -> Result<Self, QkKernelError> {
        if priority == 0 {
            return Err(QkKernelError::InvalidPriority {
                priority,
                reason: "priority 0 is reserved for the idle context",
            });
        }
        if priority > self.config.max_active {
            return Err(QkKernelError::InvalidPriority {
                priority,
                reason: "exceeds the configured max_active",
            });
        }
        if queue_len == 0 {
            return Err(QkKernelError::ZeroCapacity(id));
        }
        for reg in &self.registrations {
            if reg.object.priority() == priority {
                return Err(QkKernelError::DuplicatePriority(priority));
            }
            if reg.object.id() == id {
                return Err(QkKernelError::DuplicateId(id));
            }
        }
        self.registrations.push(Registration {
            object: ActiveObject::new(id, priority, behavior),
            queue_len,
        });
        Ok(self)
    }

    pub fn build(mut self) -> QkKernel {
        self.registrations.sort_by_key(|reg| reg.object.priority());
        QkKernel::new(self.config, self.registrations)
    }
}

pub(crate) struct KernelState {
    pub(crate) sched: QkScheduler,
    pub(crate) queues: Vec<EventQueue>,
    pub(crate) timers: TimerWheel,
    pub(crate) subscriptions: Subscriptions,
}

pub struct QkKernel {
    config: KernelConfig,
    objects: Vec<ActiveObject<QkKernel>>,
    by_prio: Vec<Option<usize>>,
    by_id: BTreeMap<ActiveObjectId, usize>,
    pub(crate) state: Mutex<KernelState>,
    stop: AtomicBool,
}

impl QkKernel {
    pub fn builder() -> QkKernelBuilder {
        QkKernelBuilder::new()
    }

    fn new(config: KernelConfig, registrations: Vec<Registration>) -> Self {
        let mut by_prio = vec![None; usize::from(config.max_active) + 1];
        let mut by_id = BTreeMap::new();
        let mut objects = Vec::with_capacity(registrations.len());
        let mut queues = Vec::with_capacity(registrations.len());

        for (index, reg) in registrations.into_iter().enumerate() {
            by_prio[usize::from(reg.object.priority())] = Some(index);
            by_id.insert(reg.object.id(), index);
            queues.push(EventQueue::new(reg.queue_len));
            objects.push(reg.object);
        }

        let timers = TimerWheel::new(config.max_tick_rate);
        let subscriptions = Subscriptions::new(config.max_pub_signal);
        debug!(target: "qk", "{} built with {} active objects", config.name, objects.len());

        Self {
            config,
            objects,
            by_prio,
            by_id,
            state: Mutex::new(KernelState {
                sched: QkScheduler::new(),
                queues,
                timers,
                subscriptions,
            }),
            stop: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Runs every object's start hook in priority order, then releases the
    /// start-up lock and activates whatever became ready meanwhile.
    pub fn start(&self) {
        require(!self.state.lock().sched.is_started(), MODULE, 100);
        for object in &self.objects {
            object.start(self);
        }
        let mut state = self.state.lock();
        state.sched.release_startup_lock();
        debug!(target: "qk", "{} started", self.config.name);
        drop(self.schedule(state));
    }

    /// Starts the kernel and runs the idle loop until [`stop`](Self::stop).
    pub fn run<F: FnMut(&Self)>(&self, mut on_idle: F) {
        self.start();
        while !self.stop.load(Ordering::Acquire) {
            if let Some(callback) = self.config.idle_callback {
                callback();
            }
            on_idle(self);
        }
        debug!(target: "qk", "{} stopped", self.config.name);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// FIFO post that must succeed.
    pub fn post(&self, target: ActiveObjectId, event: DynEvent) {
        self.post_fifo(target, event, NO_MARGIN);
    }

    pub fn post_fifo(&self, target: ActiveObjectId, event: DynEvent, margin: u16) -> bool {
        self.post_with(self.index_of(target), |queue| queue.post_fifo(event, margin))
    }

    pub fn post_lifo(&self, target: ActiveObjectId, event: DynEvent, margin: u16) -> bool {
        self.post_with(self.index_of(target), |queue| queue.post_lifo(event, margin))
    }

    /// Posts `event` to every object subscribed to its signal, highest
    /// priority first. The scheduler stays locked up to the top subscriber
    /// until every copy is queued, so none of them runs ahead of the others.
    pub fn publish(&self, event: DynEvent) {
        let mut pending = self.state.lock().subscriptions.subscribers(event.signal());
        let Some(top) = pending.find_max() else {
            trace!(target: "qk", "publish {} has no subscribers", event.signal());
            return;
        };
        let status = self.sched_lock(top);
        while let Some(prio) = pending.find_max() {
            pending.remove(prio);
            let index = match self.by_prio.get(usize::from(prio)).copied().flatten() {
                Some(index) => index,
                None => on_assert(MODULE, 300),
            };
            self.post_with(index, |queue| queue.post_fifo(event.clone(), NO_MARGIN));
        }
        self.sched_unlock(status);
    }

    pub fn subscribe(&self, subscriber: ActiveObjectId, signal: Signal) {
        let prio = self.objects[self.index_of(subscriber)].priority();
        self.state.lock().subscriptions.subscribe(signal, prio);
    }

    pub fn unsubscribe(&self, subscriber: ActiveObjectId, signal: Signal) {
        let prio = self.objects[self.index_of(subscriber)].priority();
        self.state.lock().subscriptions.unsubscribe(signal, prio);
    }

    pub fn unsubscribe_all(&self, subscriber: ActiveObjectId) {
        let prio = self.objects[self.index_of(subscriber)].priority();
        self.state.lock().subscriptions.unsubscribe_all(prio);
    }

    fn post_with(&self, index: usize, insert: impl FnOnce(&mut EventQueue) -> bool) -> bool {
        let prio = self.objects[index].priority();
        let mut state = self.state.lock();
        if !insert(&mut state.queues[index]) {
            return false;
        }
        state.sched.ready_mut().insert(prio);
        if !state.sched.in_isr() {
            drop(self.schedule(state));
        }
        true
    }

    /// Runs `handler` as an interrupt service routine. Posts made inside do
    /// not activate anything until the outermost ISR returns.
    pub fn isr<R>(&self, handler: impl FnOnce(&Self) -> R) -> R {
        self.state.lock().sched.enter_isr();
        let result = handler(self);
        let mut state = self.state.lock();
        if state.sched.exit_isr() {
            drop(self.schedule(state));
        }
        result
    }

    /// Raises the scheduler lock ceiling; a no-op inside an ISR.
    pub fn sched_lock(&self, ceiling: u8) -> SchedStatus {
        let mut state = self.state.lock();
        if state.sched.in_isr() {
            return SchedStatus::Unlocked;
        }
        state.sched.lock(ceiling)
    }

    /// Restores the ceiling saved by [`sched_lock`](Self::sched_lock) and
    /// activates anything it was holding back.
    pub fn sched_unlock(&self, status: SchedStatus) {
        let mut state = self.state.lock();
        if state.sched.in_isr() {
            return;
        }
        if state.sched.unlock(status) {
            drop(self.schedule(state));
        }
    }

    pub fn is_isr_context(&self) -> bool {
        self.state.lock().sched.in_isr()
    }

    pub fn current_priority(&self) -> u8 {
        self.state.lock().sched.active_priority()
    }

    pub fn lock_ceiling(&self) -> u8 {
        self.state.lock().sched.lock_ceiling()
    }

    pub fn is_ready(&self, prio: u8) -> bool {
        self.state.lock().sched.ready().contains(prio)
    }

    pub fn queue_stats(&self, target: ActiveObjectId) -> QueueStats {
        let index = self.index_of(target);
        self.state.lock().queues[index].stats()
    }

    pub(crate) fn contains(&self, target: ActiveObjectId) -> bool {
        self.by_id.contains_key(&target)
    }

    fn index_of(&self, target: ActiveObjectId) -> usize {
        match self.by_id.get(&target) {
            Some(&index) => index,
            None => on_assert(MODULE, 200),
        }
    }

    fn schedule<'a>(&'a self, mut state: MutexGuard<'a, KernelState>) -> MutexGuard<'a, KernelState> {
        if state.sched.sched().is_some() {
            state = self.activate(state);
        }
        state
    }

    /// Dispatches ready objects above the entry priority until none is left,
    /// then restores the entry priority. Re-entered from ISR exits, posts
    /// and unlocks made by the objects it dispatches.
    fn activate<'a>(&'a self, mut state: MutexGuard<'a, KernelState>) -> MutexGuard<'a, KernelState> {
        let pin = state.sched.active_priority();
        let mut prio = state.sched.take_next();

        loop {
            let index = match self.by_prio.get(usize::from(prio)).copied().flatten() {
                Some(index) => index,
                None => on_assert(MODULE, 500),
            };
            state.sched.set_active(prio);
            let event = match state.queues[index].get() {
                Some(event) => event,
                None => on_assert(MODULE, 510),
            };
            drop(state);

            trace!(target: "qk::sched", "dispatch {} to prio={prio}", event.signal());
            self.objects[index].dispatch(self, event);

            state = self.state.lock();
            // a basic thread must release the scheduler lock before returning
            require(state.sched.lock_holder() != prio, MODULE, 520);
            if state.queues[index].is_empty() {
                state.sched.ready_mut().remove(prio);
            }
            match state.sched.next_after_dispatch(pin) {
                Some(next) => prio = next,
                None => break,
            }
        }

        state.sched.set_active(pin);
        state
    }
}
