//! Bounded event queue.
//!
//! Each active object owns one queue of fixed capacity. Posting takes a
//! *margin*: `0` or [`NO_MARGIN`] demand that the event is accepted and
//! raise a fatal assertion on overflow, while `N > 0` accepts the event only
//! when at least `N` slots stay free after the insertion and otherwise
//! reports the refusal to the caller. The queue also tracks the low-water
//! mark of free slots.

use std::collections::VecDeque;

use log::debug;

use crate::assert::require;
use crate::event::DynEvent;

const MODULE: &str = "qf_actq";

/// Margin sentinel: insert or fault.
pub const NO_MARGIN: u16 = u16::MAX;

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: u16,
    pub n_free: u16,
    pub n_min: u16,
}

#[derive(Debug)]
pub struct EventQueue {
    ring: VecDeque<DynEvent>,
    capacity: u16,
    n_min: u16,
}

impl EventQueue {
    pub fn new(capacity: u16) -> Self {
        Self {
            ring: VecDeque::with_capacity(usize::from(capacity)),
            capacity,
            n_min: capacity,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn n_free(&self) -> u16 {
        // ring length never exceeds capacity, which fits in u16
        self.capacity - self.ring.len() as u16
    }

    /// Fewest free slots ever observed.
    pub fn n_min(&self) -> u16 {
        self.n_min
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            n_free: self.n_free(),
            n_min: self.n_min,
        }
    }

    /// Appends `event`; returns `false` if the margin refused it.
    pub fn post_fifo(&mut self, event: DynEvent, margin: u16) -> bool {
        if !self.admits(margin) {
            debug!(target: "qf::queue", "post of {} refused, margin {margin}", event.signal());
            return false;
        }
        self.ring.push_back(event);
        self.track_min();
        true
    }

    /// Prepends `event` so it is retrieved before already-queued work.
    pub fn post_lifo(&mut self, event: DynEvent, margin: u16) -> bool {
        if !self.admits(margin) {
            debug!(target: "qf::queue", "LIFO post of {} refused, margin {margin}", event.signal());
            return false;
        }
        self.ring.push_front(event);
        self.track_min();
        true
    }

    pub fn get(&mut self) -> Option<DynEvent> {
        self.ring.pop_front()
    }

    fn admits(&self, margin: u16) -> bool {
        let n_free = self.n_free();
        if margin == 0 || margin == NO_MARGIN {
            require(n_free > 0, MODULE, 110);
            true
        } else {
            n_free > margin
        }
    }

    fn track_min(&mut self) {
        self.n_min = self.n_min.min(self.n_free());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Signal;

    fn evt(sig: u16) -> DynEvent {
        DynEvent::empty_dyn(Signal(sig))
    }

    #[test]
    fn fifo_order_and_lifo_jump() {
        let mut queue = EventQueue::new(4);
        assert!(queue.post_fifo(evt(10), NO_MARGIN));
        assert!(queue.post_fifo(evt(11), NO_MARGIN));
        assert!(queue.post_lifo(evt(12), NO_MARGIN));

        let order: Vec<_> = core::iter::from_fn(|| queue.get())
            .map(|e| e.signal().0)
            .collect();
        assert_eq!(order, vec![12, 10, 11]);
        assert!(queue.get().is_none());
    }

    #[test]
    fn margin_keeps_requested_slots_free() {
        let mut queue = EventQueue::new(5);
        queue.post_fifo(evt(10), 0);
        queue.post_fifo(evt(11), 0);
        assert_eq!(queue.n_free(), 3);

        assert!(queue.post_fifo(evt(12), 2));
        assert_eq!(queue.n_free(), 2);

        assert!(!queue.post_fifo(evt(13), 2));
        assert_eq!(queue.n_free(), 2);
        assert!(queue.post_fifo(evt(13), 1));
        assert_eq!(queue.n_free(), 1);
    }

    #[test]
    fn low_water_mark_survives_draining() {
        let mut queue = EventQueue::new(3);
        queue.post_fifo(evt(10), NO_MARGIN);
        queue.post_fifo(evt(11), NO_MARGIN);
        queue.get();
        queue.get();

        let stats = queue.stats();
        assert_eq!(stats.n_free, 3);
        assert_eq!(stats.n_min, 1);
        assert_eq!(stats.capacity, 3);
    }

    #[test]
    #[should_panic(expected = "qf_actq")]
    fn zero_margin_overflow_faults() {
        let mut queue = EventQueue::new(1);
        queue.post_fifo(evt(10), 0);
        queue.post_fifo(evt(11), 0);
    }

    #[test]
    #[should_panic(expected = "qf_actq")]
    fn lifo_overflow_faults() {
        let mut queue = EventQueue::new(1);
        queue.post_lifo(evt(10), NO_MARGIN);
        queue.post_lifo(evt(11), NO_MARGIN);
    }
}
