//! Time event services.
//!
//! A [`TimerWheel`] keeps one list of linked time events per tick rate. Each
//! clock tick walks the list of its rate once: counters are decremented,
//! expired one-shot events are unlinked, periodic events reload their
//! interval, and every expiry is reported back to the kernel, which posts the
//! event (or wakes the blocked extended thread) outside the wheel. Disarming
//! only clears the counter; the entry is unlinked lazily on the next walk.
//!
//! The wheel lives inside a kernel's critical section. [`TimeEvent`] is the
//! application-facing handle and reaches the wheel through [`TimerHost`].

use log::trace;
use thiserror::Error;

use crate::active::ActiveObjectId;
use crate::assert::require;
use crate::event::Signal;

const MODULE: &str = "qf_time";

/// Index of a time event inside its wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeEventId(u16);

impl TimeEventId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A time event that reached zero during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: TimeEventId,
    pub target: ActiveObjectId,
    pub signal: Signal,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimeEventError {
    #[error("tick rate {rate} is not configured (kernel has {available})")]
    UnknownTickRate { rate: u8, available: u8 },
    #[error("{0} is reserved; time events need a user signal")]
    ReservedSignal(Signal),
    #[error("no active object or thread registered as {0:?}")]
    UnknownTarget(ActiveObjectId),
}

#[derive(Debug)]
struct Slot {
    target: ActiveObjectId,
    signal: Signal,
    tick_rate: u8,
    ctr: u32,
    interval: u32,
    linked: bool,
    was_disarmed: bool,
}

#[derive(Debug)]
pub struct TimerWheel {
    slots: Vec<Slot>,
    linked: Vec<Vec<TimeEventId>>,
}

impl TimerWheel {
    pub fn new(tick_rates: u8) -> Self {
        require(tick_rates > 0, MODULE, 100);
        Self {
            slots: Vec::new(),
            linked: (0..tick_rates).map(|_| Vec::new()).collect(),
        }
    }

    pub fn tick_rates(&self) -> u8 {
        // sized from a u8 in `new`
        self.linked.len() as u8
    }

    /// Creates a disarmed application time event.
    pub fn create(
        &mut self,
        target: ActiveObjectId,
        signal: Signal,
        tick_rate: u8,
    ) -> Result<TimeEventId, TimeEventError> {
        if !signal.is_user() {
            return Err(TimeEventError::ReservedSignal(signal));
        }
        self.create_slot(target, signal, tick_rate)
    }

    /// Creates the private timeout time event of a blocking-capable thread.
    pub fn create_timeout(
        &mut self,
        target: ActiveObjectId,
        tick_rate: u8,
    ) -> Result<TimeEventId, TimeEventError> {
        self.create_slot(target, Signal::TIMEOUT, tick_rate)
    }

    fn create_slot(
        &mut self,
        target: ActiveObjectId,
        signal: Signal,
        tick_rate: u8,
    ) -> Result<TimeEventId, TimeEventError> {
        if tick_rate >= self.tick_rates() {
            return Err(TimeEventError::UnknownTickRate {
                rate: tick_rate,
                available: self.tick_rates(),
            });
        }
        require(self.slots.len() < usize::from(u16::MAX), MODULE, 110);
        let id = TimeEventId(self.slots.len() as u16);
        self.slots.push(Slot {
            target,
            signal,
            tick_rate,
            ctr: 0,
            interval: 0,
            linked: false,
            was_disarmed: false,
        });
        Ok(id)
    }

    /// Arms a disarmed time event for `n_ticks`; a non-zero `interval` makes
    /// it periodic.
    pub fn arm(&mut self, id: TimeEventId, n_ticks: u32, interval: u32) {
        require(n_ticks != 0, MODULE, 200);
        let slot = self.slot_mut(id);
        require(slot.ctr == 0, MODULE, 210);
        slot.ctr = n_ticks;
        slot.interval = interval;
        slot.was_disarmed = false;
        self.link(id);
        trace!(target: "qf::time", "arm te#{} ticks={n_ticks} interval={interval}", id.0);
    }

    /// Disarms the time event; returns whether it was armed.
    pub fn disarm(&mut self, id: TimeEventId) -> bool {
        let slot = self.slot_mut(id);
        let was_armed = slot.ctr != 0;
        slot.ctr = 0;
        slot.was_disarmed = was_armed;
        was_armed
    }

    /// Reloads the counter with `n_ticks`, arming the event if needed.
    /// Returns whether it was armed before the call.
    pub fn rearm(&mut self, id: TimeEventId, n_ticks: u32) -> bool {
        require(n_ticks != 0, MODULE, 300);
        let slot = self.slot_mut(id);
        let was_armed = slot.ctr != 0;
        slot.ctr = n_ticks;
        self.link(id);
        was_armed
    }

    /// Reports whether the last `disarm` stopped a running event, then
    /// latches the flag so later queries report `true` until re-armed.
    pub fn was_disarmed(&mut self, id: TimeEventId) -> bool {
        let slot = self.slot_mut(id);
        let was = slot.was_disarmed;
        slot.was_disarmed = true;
        was
    }

    pub fn current_counter(&self, id: TimeEventId) -> u32 {
        self.slot(id).ctr
    }

    pub fn is_armed(&self, id: TimeEventId) -> bool {
        self.slot(id).ctr != 0
    }

    /// True when no time event is running at `tick_rate`.
    pub fn no_active(&self, tick_rate: u8) -> bool {
        require(tick_rate < self.tick_rates(), MODULE, 400);
        self.linked[usize::from(tick_rate)]
            .iter()
            .all(|id| self.slots[id.index()].ctr == 0)
    }

    /// Processes one clock tick of `tick_rate`, appending expiries to
    /// `expired` in list order.
    pub fn tick(&mut self, tick_rate: u8, expired: &mut Vec<Expired>) {
        require(tick_rate < self.tick_rates(), MODULE, 500);
        let slots = &mut self.slots;
        self.linked[usize::from(tick_rate)].retain(|&id| {
            let slot = &mut slots[id.index()];
            if slot.ctr == 0 {
                slot.linked = false;
                return false;
            }
            slot.ctr -= 1;
            if slot.ctr != 0 {
                return true;
            }
            expired.push(Expired {
                id,
                target: slot.target,
                signal: slot.signal,
            });
            if slot.interval != 0 {
                slot.ctr = slot.interval;
                true
            } else {
                slot.linked = false;
                false
            }
        });
    }

    fn link(&mut self, id: TimeEventId) {
        let slot = &mut self.slots[id.index()];
        if !slot.linked {
            slot.linked = true;
            self.linked[usize::from(slot.tick_rate)].push(id);
        }
    }

    fn slot(&self, id: TimeEventId) -> &Slot {
        match self.slots.get(id.index()) {
            Some(slot) => slot,
            None => crate::assert::on_assert(MODULE, 900),
        }
    }

    fn slot_mut(&mut self, id: TimeEventId) -> &mut Slot {
        match self.slots.get_mut(id.index()) {
            Some(slot) => slot,
            None => crate::assert::on_assert(MODULE, 900),
        }
    }
}

/// Access to the timer wheel owned by a kernel.
pub trait TimerHost {
    /// Runs `f` on the wheel inside the kernel's critical section.
    fn with_timers<R>(&self, f: impl FnOnce(&mut TimerWheel) -> R) -> R;

    /// Whether `target` names a registered active object or thread.
    fn has_target(&self, target: ActiveObjectId) -> bool;
}

/// Application handle to a time event living in a kernel's wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEvent {
    id: TimeEventId,
}

impl TimeEvent {
    pub fn new<H: TimerHost>(
        host: &H,
        target: ActiveObjectId,
        signal: Signal,
        tick_rate: u8,
    ) -> Result<Self, TimeEventError> {
        if !host.has_target(target) {
            return Err(TimeEventError::UnknownTarget(target));
        }
        let id = host.with_timers(|wheel| wheel.create(target, signal, tick_rate))?;
        Ok(Self { id })
    }

    pub fn id(&self) -> TimeEventId {
        self.id
    }

    pub fn arm<H: TimerHost>(&self, host: &H, n_ticks: u32, interval: u32) {
        host.with_timers(|wheel| wheel.arm(self.id, n_ticks, interval));
    }

    pub fn disarm<H: TimerHost>(&self, host: &H) -> bool {
        host.with_timers(|wheel| wheel.disarm(self.id))
    }

    pub fn rearm<H: TimerHost>(&self, host: &H, n_ticks: u32) -> bool {
        host.with_timers(|wheel| wheel.rearm(self.id, n_ticks))
    }

    pub fn was_disarmed<H: TimerHost>(&self, host: &H) -> bool {
        host.with_timers(|wheel| wheel.was_disarmed(self.id))
    }

    pub fn current_counter<H: TimerHost>(&self, host: &H) -> u32 {
        host.with_timers(|wheel| wheel.current_counter(self.id))
    }
}
