//! QXK kernel: registration, posting, the basic-thread activation loop and
//! the hand-off of the CPU between the basic context and extended threads.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, error, trace};
use qf::assert::{on_assert, require};
use qf::sync::{Mutex, MutexGuard};
use qf::{
    ActiveBehavior, ActiveObject, ActiveObjectId, DynEvent, EventQueue, KernelConfig, QueueStats,
    Signal, Subscriptions, TimerWheel, NO_MARGIN,
};
use thiserror::Error;

use crate::primitives::CeilingMutex;
use crate::scheduler::{Context, Occupant, QxkScheduler, SchedStatus, ScheduleMode};
use crate::thread::{
    Blocker, Gate, ThreadConfig, ThreadControl, ThreadHandler, XThread, MIN_HOST_STACK,
    NO_TIMEOUT,
};

const MODULE: &str = "qxk";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QxkKernelError {
    #[error("priority {0} already registered")]
    DuplicatePriority(u8),
    #[error("{0:?} already registered")]
    DuplicateId(ActiveObjectId),
    #[error("invalid priority {priority}: {reason}")]
    InvalidPriority { priority: u8, reason: &'static str },
    #[error("active object {0:?} needs a non-empty event queue")]
    ZeroCapacity(ActiveObjectId),
    #[error("tick rate {rate} out of range (kernel has {available})")]
    UnknownTickRate { rate: u8, available: u8 },
}

struct Registration {
    object: ActiveObject<QxkKernel>,
    queue_len: u16,
}

pub struct QxkKernelBuilder {
    config: KernelConfig,
    objects: Vec<Registration>,
    threads: Vec<ThreadConfig>,
    ceilings: Vec<u8>,
}

impl Default for QxkKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QxkKernelBuilder {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            config,
            objects: Vec::new(),
            threads: Vec::new(),
            ceilings: Vec::new(),
        }
    }

    /// Registers a basic thread (active object).
    pub fn register_ao<B: ActiveBehavior<QxkKernel>>(
        mut self,
        id: ActiveObjectId,
        priority: u8,
        queue_len: u16,
        behavior: B,
    ) -> Result<Self, QxkKernelError> {
        self.claim_priority(priority)?;
        self.claim_id(id)?;
        if queue_len == 0 {
            return Err(QxkKernelError::ZeroCapacity(id));
        }
        self.objects.push(Registration {
            object: ActiveObject::new(id, priority, behavior),
            queue_len,
        });
        Ok(self)
    }

    /// Registers an extended thread.
    pub fn register_thread(mut self, config: ThreadConfig) -> Result<Self, QxkKernelError> {
        self.claim_priority(config.priority)?;
        self.claim_id(config.id)?;
        if config.tick_rate >= self.config.max_tick_rate {
            return Err(QxkKernelError::UnknownTickRate {
                rate: config.tick_rate,
                available: self.config.max_tick_rate,
            });
        }
        self.threads.push(config);
        Ok(self)
    }

    /// Reserves the ceiling priority of `mutex`. A zero ceiling reserves
    /// nothing.
    pub fn register_mutex(mut self, mutex: &CeilingMutex) -> Result<Self, QxkKernelError> {
        let ceiling = mutex.ceiling();
        if ceiling != 0 {
            self.claim_priority(ceiling)?;
            self.ceilings.push(ceiling);
        }
        Ok(self)
    }

    pub fn build(mut self) -> Arc<QxkKernel> {
        self.objects.sort_by_key(|reg| reg.object.priority());
        QxkKernel::new(self.config, self.objects, self.threads, self.ceilings)
    }

    fn claim_priority(&self, priority: u8) -> Result<(), QxkKernelError> {
        if priority == 0 {
            return Err(QxkKernelError::InvalidPriority {
                priority,
                reason: "priority 0 is reserved for the idle context",
            });
        }
        if priority > self.config.max_active {
            return Err(QxkKernelError::InvalidPriority {
                priority,
                reason: "exceeds the configured max_active",
            });
        }
        let taken = self.objects.iter().any(|reg| reg.object.priority() == priority)
            || self.threads.iter().any(|config| config.priority == priority)
            || self.ceilings.contains(&priority);
        if taken {
            return Err(QxkKernelError::DuplicatePriority(priority));
        }
        Ok(())
    }

    fn claim_id(&self, id: ActiveObjectId) -> Result<(), QxkKernelError> {
        let taken = self.objects.iter().any(|reg| reg.object.id() == id)
            || self.threads.iter().any(|config| config.id == id);
        if taken {
            return Err(QxkKernelError::DuplicateId(id));
        }
        Ok(())
    }
}

/// Registered entity behind an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Member {
    Basic(usize),
    Thread(usize),
}

pub(crate) struct KernelState {
    pub(crate) sched: QxkScheduler,
    pub(crate) queues: Vec<EventQueue>,
    /// Current priority of each active object, raised while it holds a
    /// ceiling mutex.
    pub(crate) ao_prio: Vec<u8>,
    pub(crate) threads: Vec<ThreadControl>,
    pub(crate) timers: TimerWheel,
    pub(crate) subscriptions: Subscriptions,
}

impl KernelState {
    /// Makes a blocked thread ready again with its timeout disarmed.
    pub(crate) fn unblock(&mut self, index: usize) {
        let control = &mut self.threads[index];
        self.timers.disarm(control.timeout);
        control.blocked = Blocker::Running;
        control.timed_out = false;
        self.sched.ready_mut().insert(control.prio);
    }

    /// Handles the expiry of a thread's private timeout.
    pub(crate) fn expire_timeout(&mut self, index: usize) {
        let control = &mut self.threads[index];
        match std::mem::take(&mut control.blocked) {
            Blocker::Running => return,
            Blocker::Delay | Blocker::Queue => {}
            Blocker::Object(waits) => waits.remove_waiter(control.prio),
        }
        control.timed_out = true;
        self.sched.ready_mut().insert(control.prio);
    }

    /// The extended thread that may block right now, faulting if the caller
    /// is anything else.
    pub(crate) fn blocking_thread(&self) -> usize {
        require(!self.sched.in_isr(), MODULE, 300);
        let index = match self.sched.current() {
            Some(index) => index,
            None => on_assert(MODULE, 310),
        };
        let control = &self.threads[index];
        require(!control.blocked.is_blocked(), MODULE, 320);
        // the scheduler-lock holder must not block
        require(self.sched.lock_holder() != control.prio, MODULE, 330);
        index
    }
}

struct ThreadSlot {
    id: ActiveObjectId,
    priority: u8,
    stack_size: usize,
    gate: Gate,
    handler: parking_lot::Mutex<Option<ThreadHandler>>,
}

pub struct QxkKernel {
    config: KernelConfig,
    objects: Vec<ActiveObject<QxkKernel>>,
    threads: Vec<ThreadSlot>,
    by_id: BTreeMap<ActiveObjectId, Member>,
    /// Members by registered priority, for publishing.
    by_prio: BTreeMap<u8, Member>,
    pub(crate) state: Mutex<KernelState>,
    idle_gate: Gate,
    fault: parking_lot::Mutex<Option<String>>,
    stop: AtomicBool,
    retired: AtomicBool,
    workers: parking_lot::Mutex<Vec<thread::JoinHandle<()>>>,
    this: Weak<QxkKernel>,
}

/// Unwind payload that ends a parked thread during [`QxkKernel::shutdown`].
struct Retired;

impl QxkKernel {
    pub fn builder() -> QxkKernelBuilder {
        QxkKernelBuilder::new()
    }

    fn new(
        config: KernelConfig,
        registrations: Vec<Registration>,
        thread_configs: Vec<ThreadConfig>,
        ceilings: Vec<u8>,
    ) -> Arc<Self> {
        let mut sched = QxkScheduler::new(config.max_active);
        let mut timers = TimerWheel::new(config.max_tick_rate);
        let mut by_id = BTreeMap::new();
        let mut by_prio = BTreeMap::new();

        let mut objects = Vec::with_capacity(registrations.len());
        let mut queues = Vec::with_capacity(registrations.len());
        let mut ao_prio = Vec::with_capacity(registrations.len());
        for (index, reg) in registrations.into_iter().enumerate() {
            let prio = reg.object.priority();
            sched.set_occupant(prio, Occupant::Basic(index));
            by_id.insert(reg.object.id(), Member::Basic(index));
            by_prio.insert(prio, Member::Basic(index));
            queues.push(EventQueue::new(reg.queue_len));
            ao_prio.push(prio);
            objects.push(reg.object);
        }

        let mut threads = Vec::with_capacity(thread_configs.len());
        let mut controls = Vec::with_capacity(thread_configs.len());
        for (index, config) in thread_configs.into_iter().enumerate() {
            let timeout = match timers.create_timeout(config.id, config.tick_rate) {
                Ok(timeout) => timeout,
                Err(_) => on_assert(MODULE, 100),
            };
            sched.set_occupant(config.priority, Occupant::Thread(index));
            by_id.insert(config.id, Member::Thread(index));
            by_prio.insert(config.priority, Member::Thread(index));
            controls.push(ThreadControl::new(config.priority, config.queue_len, timeout));
            threads.push(ThreadSlot {
                id: config.id,
                priority: config.priority,
                stack_size: config.stack_size,
                gate: Gate::default(),
                handler: parking_lot::Mutex::new(Some(config.handler)),
            });
        }

        for ceiling in ceilings {
            sched.set_occupant(ceiling, Occupant::Reserved);
        }
        let subscriptions = Subscriptions::new(config.max_pub_signal);

        debug!(
            target: "qxk",
            "{} built with {} active objects and {} threads",
            config.name,
            objects.len(),
            threads.len()
        );

        Arc::new_cyclic(|this| Self {
            config,
            objects,
            threads,
            by_id,
            by_prio,
            state: Mutex::new(KernelState {
                sched,
                queues,
                ao_prio,
                threads: controls,
                timers,
                subscriptions,
            }),
            idle_gate: Gate::default(),
            fault: parking_lot::Mutex::new(None),
            stop: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            workers: parking_lot::Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Runs the active objects' start hooks, launches every extended
    /// thread, then releases the start-up lock. Returns on the basic
    /// context once nothing above idle is ready.
    pub fn start(&self) {
        require(!self.state.lock().sched.is_started(), MODULE, 110);
        for object in &self.objects {
            object.start(self);
        }

        let this = match self.this.upgrade() {
            Some(this) => this,
            None => on_assert(MODULE, 111),
        };
        for (index, slot) in self.threads.iter().enumerate() {
            let handler = match slot.handler.lock().take() {
                Some(handler) => handler,
                None => on_assert(MODULE, 112),
            };
            let kernel = Arc::clone(&this);
            let spawned = thread::Builder::new()
                .name(format!("qxk-{}", slot.id.0))
                .stack_size(slot.stack_size.max(MIN_HOST_STACK))
                .spawn(move || thread_main(kernel, index, handler));
            match spawned {
                Ok(worker) => self.workers.lock().push(worker),
                Err(err) => {
                    error!(target: "qxk", "cannot spawn thread {:?}: {err}", slot.id);
                    on_assert(MODULE, 113);
                }
            }
        }

        let mut state = self.state.lock();
        let prios: Vec<u8> = state.threads.iter().map(|control| control.prio).collect();
        for prio in prios {
            state.sched.ready_mut().insert(prio);
        }
        state.sched.release_startup_lock();
        debug!(target: "qxk", "{} started", self.config.name);
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
        debug!(target: "qxk", "{} stopped", self.config.name);
        self.shutdown();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Ends every extended thread still parked in the kernel and joins its
    /// host thread. Called on the basic context; [`run`](Self::run) does so
    /// on its way out. No thread can be switched to afterwards.
    pub fn shutdown(&self) {
        {
            let state = self.state.lock();
            require(!state.sched.in_isr(), MODULE, 700);
            require(state.sched.current().is_none(), MODULE, 701);
        }
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        for slot in &self.threads {
            slot.gate.open();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!(target: "qxk", "{}: a thread failed while shutting down", self.config.name);
            }
        }
        debug!(target: "qxk", "{} shut down", self.config.name);
    }

    /// FIFO post that must succeed.
    pub fn post(&self, target: ActiveObjectId, event: DynEvent) {
        self.post_fifo(target, event, NO_MARGIN);
    }

    /// Posts to an active object or to an extended thread's queue. A thread
    /// blocked on its queue is woken.
    pub fn post_fifo(&self, target: ActiveObjectId, event: DynEvent, margin: u16) -> bool {
        self.post_member(self.member(target), event, margin)
    }

    /// Posts `event` to every active object and thread subscribed to its
    /// signal, highest priority first. The scheduler stays locked up to the
    /// top subscriber until every copy is queued.
    pub fn publish(&self, event: DynEvent) {
        let mut pending = self.state.lock().subscriptions.subscribers(event.signal());
        let Some(top) = pending.find_max() else {
            trace!(target: "qxk", "publish {} has no subscribers", event.signal());
            return;
        };
        let status = self.sched_lock(top);
        while let Some(prio) = pending.find_max() {
            pending.remove(prio);
            let member = match self.by_prio.get(&prio) {
                Some(&member) => member,
                None => on_assert(MODULE, 230),
            };
            self.post_member(member, event.clone(), NO_MARGIN);
        }
        self.sched_unlock(status);
    }

    /// Subscribes an active object, or a thread with a queue, to `signal`.
    pub fn subscribe(&self, subscriber: ActiveObjectId, signal: Signal) {
        let member = self.member(subscriber);
        let mut state = self.state.lock();
        if let Member::Thread(index) = member {
            require(state.threads[index].queue.is_some(), MODULE, 240);
        }
        let prio = self.home_priority(member);
        state.subscriptions.subscribe(signal, prio);
    }

    pub fn unsubscribe(&self, subscriber: ActiveObjectId, signal: Signal) {
        let prio = self.home_priority(self.member(subscriber));
        self.state.lock().subscriptions.unsubscribe(signal, prio);
    }

    pub fn unsubscribe_all(&self, subscriber: ActiveObjectId) {
        let prio = self.home_priority(self.member(subscriber));
        self.state.lock().subscriptions.unsubscribe_all(prio);
    }

    fn post_member(&self, member: Member, event: DynEvent, margin: u16) -> bool {
        let mut state = self.state.lock();
        match member {
            Member::Basic(index) => {
                if !state.queues[index].post_fifo(event, margin) {
                    return false;
                }
                let prio = state.ao_prio[index];
                state.sched.ready_mut().insert(prio);
            }
            Member::Thread(index) => {
                let control = &mut state.threads[index];
                let queue = match control.queue.as_mut() {
                    Some(queue) => queue,
                    None => on_assert(MODULE, 210),
                };
                if !queue.post_fifo(event, margin) {
                    return false;
                }
                if matches!(control.blocked, Blocker::Queue) {
                    state.unblock(index);
                }
            }
        }
        if !state.sched.in_isr() {
            drop(self.schedule(state));
        }
        true
    }

    /// LIFO post, for active objects only.
    pub fn post_lifo(&self, target: ActiveObjectId, event: DynEvent, margin: u16) -> bool {
        let index = match self.member(target) {
            Member::Basic(index) => index,
            Member::Thread(_) => on_assert(MODULE, 220),
        };
        let mut state = self.state.lock();
        if !state.queues[index].post_lifo(event, margin) {
            return false;
        }
        let prio = state.ao_prio[index];
        state.sched.ready_mut().insert(prio);
        if !state.sched.in_isr() {
            drop(self.schedule(state));
        }
        true
    }

    /// Runs `handler` as an interrupt service routine; scheduling happens
    /// when the outermost ISR returns.
    pub fn isr<R>(&self, handler: impl FnOnce(&Self) -> R) -> R {
        self.state.lock().sched.enter_isr();
        let result = handler(self);
        let mut state = self.state.lock();
        if state.sched.exit_isr() {
            drop(self.schedule(state));
        }
        result
    }

    /// Raises the scheduler lock ceiling on behalf of the running context;
    /// a no-op inside an ISR.
    pub fn sched_lock(&self, ceiling: u8) -> SchedStatus {
        let mut state = self.state.lock();
        if state.sched.in_isr() {
            return SchedStatus::Unlocked;
        }
        let holder = match state.sched.current() {
            Some(index) => state.threads[index].prio,
            None => state.sched.active_priority(),
        };
        state.sched.lock(ceiling, holder)
    }

    pub fn sched_unlock(&self, status: SchedStatus) {
        let mut state = self.state.lock();
        if state.sched.in_isr() {
            return;
        }
        if state.sched.unlock(status) {
            drop(self.schedule(state));
        }
    }

    /// Ends a thread's [`XThread::delay`] early. Returns false when the
    /// thread was not delaying.
    pub fn delay_cancel(&self, thread: ActiveObjectId) -> bool {
        let index = match self.member(thread) {
            Member::Thread(index) => index,
            Member::Basic(_) => on_assert(MODULE, 410),
        };
        let mut state = self.state.lock();
        if !matches!(state.threads[index].blocked, Blocker::Delay) {
            return false;
        }
        state.unblock(index);
        if !state.sched.in_isr() {
            drop(self.schedule(state));
        }
        true
    }

    pub fn is_isr_context(&self) -> bool {
        self.state.lock().sched.in_isr()
    }

    /// Priority of whatever context is running.
    pub fn current_priority(&self) -> u8 {
        let state = self.state.lock();
        match state.sched.current() {
            Some(index) => state.threads[index].prio,
            None => state.sched.active_priority(),
        }
    }

    /// The running extended thread, or `None` on the basic context.
    pub fn current_thread(&self) -> Option<ActiveObjectId> {
        let index = self.state.lock().sched.current()?;
        Some(self.threads[index].id)
    }

    pub fn lock_ceiling(&self) -> u8 {
        self.state.lock().sched.lock_ceiling()
    }

    pub fn is_ready(&self, prio: u8) -> bool {
        self.state.lock().sched.ready().contains(prio)
    }

    /// Whether an extended thread's body has returned.
    pub fn is_terminated(&self, thread: ActiveObjectId) -> bool {
        match self.member(thread) {
            Member::Thread(index) => self.state.lock().threads[index].terminated,
            Member::Basic(_) => false,
        }
    }

    pub fn queue_stats(&self, target: ActiveObjectId) -> Option<QueueStats> {
        let state = self.state.lock();
        match self.member(target) {
            Member::Basic(index) => Some(state.queues[index].stats()),
            Member::Thread(index) => state.threads[index].queue.as_ref().map(EventQueue::stats),
        }
    }

    pub(crate) fn contains(&self, target: ActiveObjectId) -> bool {
        self.by_id.contains_key(&target)
    }

    pub(crate) fn member(&self, target: ActiveObjectId) -> Member {
        match self.by_id.get(&target) {
            Some(&member) => member,
            None => on_assert(MODULE, 200),
        }
    }

    /// Priority a member was registered at.
    fn home_priority(&self, member: Member) -> u8 {
        match member {
            Member::Basic(index) => self.objects[index].priority(),
            Member::Thread(index) => self.threads[index].priority,
        }
    }

    pub(crate) fn thread_id(&self, index: usize) -> ActiveObjectId {
        self.threads[index].id
    }

    pub(crate) fn thread_priority(&self, index: usize) -> u8 {
        self.state.lock().threads[index].prio
    }

    pub(crate) fn delay(&self, index: usize, n_ticks: u32) -> bool {
        let state = self.state.lock();
        require(n_ticks != NO_TIMEOUT, MODULE, 400);
        require(state.blocking_thread() == index, MODULE, 401);
        let (_state, timed_out) = self.block_current(state, index, Blocker::Delay, n_ticks);
        timed_out
    }

    pub(crate) fn queue_get(&self, index: usize, n_ticks: u32) -> Option<DynEvent> {
        let mut state = self.state.lock();
        require(state.blocking_thread() == index, MODULE, 420);
        let queue = match state.threads[index].queue.as_mut() {
            Some(queue) => queue,
            None => on_assert(MODULE, 421),
        };
        if let Some(event) = queue.get() {
            return Some(event);
        }
        let (mut state, _) = self.block_current(state, index, Blocker::Queue, n_ticks);
        state.threads[index].queue.as_mut().and_then(EventQueue::get)
    }

    /// Parks the running thread on `blocker`, arming its timeout unless
    /// `n_ticks` is [`NO_TIMEOUT`]. Returns once the thread runs again,
    /// together with whether the timeout woke it.
    pub(crate) fn block_current<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        index: usize,
        blocker: Blocker,
        n_ticks: u32,
    ) -> (MutexGuard<'a, KernelState>, bool) {
        let control = &mut state.threads[index];
        control.blocked = blocker;
        control.timed_out = false;
        let prio = control.prio;
        let timeout = control.timeout;
        if n_ticks != NO_TIMEOUT {
            state.timers.arm(timeout, n_ticks, 0);
        }
        state.sched.ready_mut().remove(prio);
        trace!(target: "qxk::sched", "thread prio={prio} blocks for {n_ticks} ticks");

        state = self.schedule(state);
        let timed_out = state.threads[index].timed_out;
        (state, timed_out)
    }

    /// Runs scheduling passes from the calling context until it is the one
    /// that should own the CPU.
    pub(crate) fn schedule<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
    ) -> MutexGuard<'a, KernelState> {
        loop {
            state = match state.sched.plan() {
                ScheduleMode::Stay => return state,
                ScheduleMode::Activate(prio) => self.activate(state, prio),
                ScheduleMode::Switch(to) => self.context_switch(state, to),
            };
        }
    }

    /// Dispatches basic threads above the entry priority, starting with
    /// `prio`, and restores the entry priority.
    fn activate<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        mut prio: u8,
    ) -> MutexGuard<'a, KernelState> {
        let pin = state.sched.active_priority();

        loop {
            let index = match state.sched.occupant(prio) {
                Occupant::Basic(index) => index,
                _ => on_assert(MODULE, 500),
            };
            state.sched.set_active(prio);
            let event = match state.queues[index].get() {
                Some(event) => event,
                None => on_assert(MODULE, 510),
            };
            drop(state);

            trace!(target: "qxk::sched", "dispatch {} to prio={prio}", event.signal());
            self.objects[index].dispatch(self, event);

            state = self.state.lock();
            require(state.sched.lock_holder() != prio, MODULE, 520);
            // a basic thread must not return while holding a ceiling mutex
            require(state.ao_prio[index] == prio, MODULE, 530);
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

    /// Hands the CPU from the calling context to `to` and parks until some
    /// context hands it back.
    fn context_switch<'a>(
        &'a self,
        mut state: MutexGuard<'a, KernelState>,
        to: Context,
    ) -> MutexGuard<'a, KernelState> {
        require(!self.is_retired(), MODULE, 710);
        let from = match state.sched.current() {
            Some(index) => Context::Thread(index),
            None => Context::Basic,
        };
        state.sched.switch_to(to);
        drop(state);

        self.gate(to).open();
        self.gate(from).wait();
        self.check_fault();
        if from != Context::Basic && self.is_retired() {
            panic::resume_unwind(Box::new(Retired));
        }
        self.state.lock()
    }

    fn gate(&self, context: Context) -> &Gate {
        match context {
            Context::Basic => &self.idle_gate,
            Context::Thread(index) => &self.threads[index].gate,
        }
    }

    /// Retires the calling thread after its body returned and passes the CPU
    /// on without waiting.
    fn thread_exit(&self, index: usize) {
        let mut state = self.state.lock();
        require(state.sched.current() == Some(index), MODULE, 600);
        let control = &mut state.threads[index];
        let prio = control.prio;
        require(prio == control.start_prio, MODULE, 610);
        control.terminated = true;
        require(state.sched.lock_holder() != prio, MODULE, 615);
        state.sched.ready_mut().remove(prio);
        state.sched.set_occupant(prio, Occupant::Empty);
        debug!(target: "qxk", "thread {:?} terminated", self.threads[index].id);

        match state.sched.plan() {
            ScheduleMode::Switch(to) => {
                state.sched.switch_to(to);
                drop(state);
                self.gate(to).open();
            }
            _ => on_assert(MODULE, 620),
        }
    }

    fn record_fault(&self, index: usize, payload: Box<dyn Any + Send>) {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|text| (*text).to_owned()))
            .unwrap_or_else(|| String::from("extended thread panicked"));
        error!(target: "qxk", "thread {:?} faulted: {message}", self.threads[index].id);
        *self.fault.lock() = Some(message);
        self.idle_gate.open();
    }

    /// Re-raises on the woken context a fault recorded by an extended
    /// thread.
    fn check_fault(&self) {
        if let Some(message) = self.fault.lock().clone() {
            panic!("{message}");
        }
    }

    fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

fn thread_main(kernel: Arc<QxkKernel>, index: usize, handler: ThreadHandler) {
    kernel.threads[index].gate.wait();
    if kernel.is_faulted() || kernel.is_retired() {
        return;
    }
    let me = XThread::new(Arc::clone(&kernel), index);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler(&me);
        kernel.thread_exit(index);
    }));
    match outcome {
        Ok(()) => {}
        Err(payload) if payload.is::<Retired>() => {
            debug!(target: "qxk", "thread {:?} retired", kernel.threads[index].id);
        }
        Err(payload) => kernel.record_fault(index, payload),
    }
}
