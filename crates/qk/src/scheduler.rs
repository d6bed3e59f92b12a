//! Scheduler bookkeeping for the QK kernel.
//!
//! [`QkScheduler`] is plain data: the kernel keeps it inside its critical
//! section and every method here assumes the caller holds that lock.

use log::trace;
use qf::assert::require;
use qf::{PrioSet, MAX_PRIO};

const MODULE: &str = "qk_sched";

/// Lock ceiling in force until the kernel is started.
pub(crate) const STARTUP_LOCK: u8 = MAX_PRIO + 1;

/// Token returned by [`QkScheduler::lock`], handed back to
/// [`QkScheduler::unlock`] to restore the previous ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    /// The ceiling was raised; restoring brings back these values.
    Locked { prev_ceiling: u8, prev_holder: u8 },
    /// The call did not change the ceiling; unlocking is a no-op.
    Unlocked,
}

impl SchedStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

#[derive(Debug)]
pub struct QkScheduler {
    ready: PrioSet,
    act_prio: u8,
    next_prio: u8,
    lock_prio: u8,
    lock_holder: u8,
    int_nest: u8,
}

impl Default for QkScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl QkScheduler {
    pub fn new() -> Self {
        Self {
            ready: PrioSet::new(),
            act_prio: 0,
            next_prio: 0,
            lock_prio: STARTUP_LOCK,
            lock_holder: 0,
            int_nest: 0,
        }
    }

    pub fn ready(&self) -> &PrioSet {
        &self.ready
    }

    pub fn ready_mut(&mut self) -> &mut PrioSet {
        &mut self.ready
    }

    pub fn active_priority(&self) -> u8 {
        self.act_prio
    }

    pub fn lock_ceiling(&self) -> u8 {
        self.lock_prio
    }

    pub fn lock_holder(&self) -> u8 {
        self.lock_holder
    }

    pub fn is_started(&self) -> bool {
        self.lock_prio != STARTUP_LOCK
    }

    /// Drops the start-up lock so the first scheduling pass can run.
    pub fn release_startup_lock(&mut self) {
        require(self.lock_prio == STARTUP_LOCK, MODULE, 100);
        self.lock_prio = 0;
    }

    pub fn in_isr(&self) -> bool {
        self.int_nest != 0
    }

    pub fn enter_isr(&mut self) {
        require(self.int_nest < u8::MAX, MODULE, 110);
        self.int_nest += 1;
    }

    /// Leaves one interrupt level; returns `true` on the outermost exit.
    pub fn exit_isr(&mut self) -> bool {
        require(self.int_nest > 0, MODULE, 120);
        self.int_nest -= 1;
        self.int_nest == 0
    }

    /// Picks the priority to activate, if one outranks both the running
    /// priority and the lock ceiling. The choice is remembered as the next
    /// priority for [`take_next`](Self::take_next).
    pub fn sched(&mut self) -> Option<u8> {
        match self.ready.find_max() {
            Some(p) if p > self.act_prio && p > self.lock_prio => {
                self.next_prio = p;
                Some(p)
            }
            _ => None,
        }
    }

    pub fn take_next(&mut self) -> u8 {
        let next = core::mem::take(&mut self.next_prio);
        require(next != 0, MODULE, 200);
        next
    }

    /// Candidate to run after a dispatch inside an activation entered
    /// at priority `pin`.
    pub fn next_after_dispatch(&self, pin: u8) -> Option<u8> {
        match self.ready.find_max() {
            Some(p) if p > pin && p > self.lock_prio => Some(p),
            _ => None,
        }
    }

    pub fn set_active(&mut self, prio: u8) {
        if prio != self.act_prio {
            if prio == 0 {
                trace!(target: "qk::sched", "idle (prev={})", self.act_prio);
            } else {
                trace!(target: "qk::sched", "next prio={prio} prev={}", self.act_prio);
            }
        }
        self.act_prio = prio;
    }

    /// Raises the lock ceiling to `ceiling`, recording the active priority
    /// as the lock holder.
    pub fn lock(&mut self, ceiling: u8) -> SchedStatus {
        if ceiling <= self.lock_prio {
            return SchedStatus::Unlocked;
        }
        let status = SchedStatus::Locked {
            prev_ceiling: self.lock_prio,
            prev_holder: self.lock_holder,
        };
        trace!(target: "qk::sched", "lock {} -> {ceiling}", self.lock_prio);
        self.lock_prio = ceiling;
        self.lock_holder = self.act_prio;
        status
    }

    /// Restores the ceiling saved in `status`; returns whether anything
    /// changed.
    pub fn unlock(&mut self, status: SchedStatus) -> bool {
        let SchedStatus::Locked {
            prev_ceiling,
            prev_holder,
        } = status
        else {
            return false;
        };
        require(self.lock_prio > prev_ceiling, MODULE, 300);
        trace!(target: "qk::sched", "unlock {} -> {prev_ceiling}", self.lock_prio);
        self.lock_prio = prev_ceiling;
        self.lock_holder = prev_holder;
        true
    }
}
