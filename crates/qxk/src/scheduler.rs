//! Dual-mode scheduling decisions for QXK.
//!
//! Basic threads (active objects) and extended threads share one priority
//! space and one ready set. A priority slot records who currently occupies
//! it, which also lets a ceiling mutex reserve its ceiling level and lend it
//! to the holder.
//!
//! ## Scheduling Policy
//!
//! 1. The highest ready priority wins; at or below the lock ceiling the lock
//!    holder's priority is used instead.
//! 2. A basic winner runs nested on the basic context, but only when it
//!    outranks the priority that context is already running.
//! 3. An extended winner gets the CPU through a context switch, unless it is
//!    the thread already running.

use log::trace;
use qf::assert::{on_assert, require};
use qf::{PrioSet, MAX_PRIO};

const MODULE: &str = "qxk_sched";

pub(crate) const STARTUP_LOCK: u8 = MAX_PRIO + 1;

/// Who holds a priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Empty,
    /// Active object, by registration index.
    Basic(usize),
    /// Extended thread, by registration index.
    Thread(usize),
    /// Ceiling level of a mutex nobody holds.
    Reserved,
}

/// An execution context that can own the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// The idle context, on whose stack every basic thread runs.
    Basic,
    Thread(usize),
}

/// Outcome of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// The running context keeps the CPU.
    Stay,
    /// Run the activation loop for this basic-thread priority.
    Activate(u8),
    /// Hand the CPU to another context.
    Switch(Context),
}

/// Token returned by [`QxkScheduler::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Locked { prev_ceiling: u8, prev_holder: u8 },
    Unlocked,
}

impl SchedStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

#[derive(Debug)]
pub struct QxkScheduler {
    ready: PrioSet,
    slots: Vec<Occupant>,
    act_prio: u8,
    lock_prio: u8,
    lock_holder: u8,
    int_nest: u8,
    curr: Option<usize>,
    next: Option<Context>,
}

impl QxkScheduler {
    /// Creates a scheduler for priorities `1..=max_prio`.
    pub fn new(max_prio: u8) -> Self {
        require(max_prio <= MAX_PRIO, MODULE, 100);
        Self {
            ready: PrioSet::new(),
            slots: vec![Occupant::Empty; usize::from(max_prio) + 1],
            act_prio: 0,
            lock_prio: STARTUP_LOCK,
            lock_holder: 0,
            int_nest: 0,
            curr: None,
            next: None,
        }
    }

    pub fn ready(&self) -> &PrioSet {
        &self.ready
    }

    pub fn ready_mut(&mut self) -> &mut PrioSet {
        &mut self.ready
    }

    pub fn occupant(&self, prio: u8) -> Occupant {
        match self.slots.get(usize::from(prio)) {
            Some(&occupant) => occupant,
            None => on_assert(MODULE, 110),
        }
    }

    pub fn set_occupant(&mut self, prio: u8, occupant: Occupant) {
        require(prio != 0, MODULE, 120);
        match self.slots.get_mut(usize::from(prio)) {
            Some(slot) => *slot = occupant,
            None => on_assert(MODULE, 121),
        }
    }

    /// The extended thread that occupies `prio`, faulting otherwise.
    pub fn thread_at(&self, prio: u8) -> usize {
        match self.occupant(prio) {
            Occupant::Thread(index) => index,
            _ => on_assert(MODULE, 130),
        }
    }

    /// Moves a ready bit from `from` to `to` if it is set.
    pub fn move_ready(&mut self, from: u8, to: u8) {
        if self.ready.contains(from) {
            self.ready.remove(from);
            self.ready.insert(to);
        }
    }

    pub fn active_priority(&self) -> u8 {
        self.act_prio
    }

    pub fn set_active(&mut self, prio: u8) {
        if prio != self.act_prio {
            trace!(target: "qxk::sched", "basic prio {} -> {prio}", self.act_prio);
        }
        self.act_prio = prio;
    }

    pub fn lock_ceiling(&self) -> u8 {
        self.lock_prio
    }

    pub fn lock_holder(&self) -> u8 {
        self.lock_holder
    }

    pub fn current(&self) -> Option<usize> {
        self.curr
    }

    pub fn next(&self) -> Option<Context> {
        self.next
    }

    pub fn is_started(&self) -> bool {
        self.lock_prio != STARTUP_LOCK
    }

    pub fn release_startup_lock(&mut self) {
        require(self.lock_prio == STARTUP_LOCK, MODULE, 140);
        self.lock_prio = 0;
    }

    pub fn in_isr(&self) -> bool {
        self.int_nest != 0
    }

    pub fn enter_isr(&mut self) {
        require(self.int_nest < u8::MAX, MODULE, 150);
        self.int_nest += 1;
    }

    pub fn exit_isr(&mut self) -> bool {
        require(self.int_nest > 0, MODULE, 151);
        self.int_nest -= 1;
        self.int_nest == 0
    }

    /// Effective highest priority: the top ready level, or the lock holder
    /// when that level is covered by the lock ceiling.
    fn effective_max(&self) -> u8 {
        let p = self.ready.find_max().unwrap_or(0);
        if p <= self.lock_prio {
            self.lock_holder
        } else {
            p
        }
    }

    fn context_of(&self, prio: u8) -> Context {
        if prio == 0 {
            return Context::Basic;
        }
        match self.occupant(prio) {
            Occupant::Basic(_) => Context::Basic,
            Occupant::Thread(index) => Context::Thread(index),
            Occupant::Empty | Occupant::Reserved => on_assert(MODULE, 200),
        }
    }

    /// Decides what the CPU should do next, from the running context's
    /// point of view.
    pub fn plan(&mut self) -> ScheduleMode {
        let p = self.effective_max();
        let mode = match (self.curr, self.context_of(p)) {
            (None, Context::Basic) if p > self.act_prio => ScheduleMode::Activate(p),
            (None, Context::Basic) => ScheduleMode::Stay,
            (Some(running), Context::Thread(index)) if running == index => ScheduleMode::Stay,
            (_, to) => ScheduleMode::Switch(to),
        };
        self.next = match mode {
            ScheduleMode::Switch(to) => Some(to),
            _ => None,
        };
        mode
    }

    /// Basic priority to dispatch after a dispatch completed inside an
    /// activation entered at `pin`.
    pub fn next_after_dispatch(&self, pin: u8) -> Option<u8> {
        let p = self.effective_max();
        match self.context_of(p) {
            Context::Basic if p > pin => Some(p),
            _ => None,
        }
    }

    /// Records the context switch to `to`.
    pub fn switch_to(&mut self, to: Context) {
        trace!(target: "qxk::sched", "switch {:?} -> {to:?}", self.curr);
        self.curr = match to {
            Context::Basic => None,
            Context::Thread(index) => Some(index),
        };
        self.next = None;
    }

    /// Raises the lock ceiling, recording `holder` as the lock holder.
    pub fn lock(&mut self, ceiling: u8, holder: u8) -> SchedStatus {
        if ceiling <= self.lock_prio {
            return SchedStatus::Unlocked;
        }
        let status = SchedStatus::Locked {
            prev_ceiling: self.lock_prio,
            prev_holder: self.lock_holder,
        };
        trace!(target: "qxk::sched", "lock {} -> {ceiling} by {holder}", self.lock_prio);
        self.lock_prio = ceiling;
        self.lock_holder = holder;
        status
    }

    pub fn unlock(&mut self, status: SchedStatus) -> bool {
        let SchedStatus::Locked {
            prev_ceiling,
            prev_holder,
        } = status
        else {
            return false;
        };
        require(self.lock_prio > prev_ceiling, MODULE, 300);
        trace!(target: "qxk::sched", "unlock {} -> {prev_ceiling}", self.lock_prio);
        self.lock_prio = prev_ceiling;
        self.lock_holder = prev_holder;
        true
    }
}
