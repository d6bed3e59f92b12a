//! Publish-subscribe bookkeeping.
//!
//! One [`PrioSet`] per signal records the priorities of the objects
//! subscribed to it. A kernel keeps the table inside its critical section and
//! multicasts a published event to a copy of the signal's set, highest
//! priority first.

use log::trace;

use crate::assert::require;
use crate::event::Signal;
use crate::prio_set::{PrioSet, MAX_PRIO};

const MODULE: &str = "qf_ps";

#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    lists: Vec<PrioSet>,
}

impl Subscriptions {
    /// Table for signals below `max_signal`.
    pub fn new(max_signal: u16) -> Self {
        Self {
            lists: vec![PrioSet::new(); usize::from(max_signal)],
        }
    }

    /// One past the highest signal that can be published.
    pub fn max_signal(&self) -> u16 {
        self.lists.len() as u16
    }

    pub fn subscribe(&mut self, signal: Signal, prio: u8) {
        require(self.is_user_signal(signal) && is_object_prio(prio), MODULE, 300);
        trace!(target: "qf::ps", "prio={prio} subscribes to {signal}");
        self.lists[usize::from(signal.0)].insert(prio);
    }

    pub fn unsubscribe(&mut self, signal: Signal, prio: u8) {
        require(self.is_user_signal(signal) && is_object_prio(prio), MODULE, 400);
        trace!(target: "qf::ps", "prio={prio} unsubscribes from {signal}");
        self.lists[usize::from(signal.0)].remove(prio);
    }

    /// Drops `prio` from every signal's list.
    pub fn unsubscribe_all(&mut self, prio: u8) {
        require(is_object_prio(prio), MODULE, 500);
        for list in self.lists.iter_mut().skip(usize::from(Signal::USER.0)) {
            list.remove(prio);
        }
    }

    pub fn is_subscribed(&self, signal: Signal, prio: u8) -> bool {
        self.lists
            .get(usize::from(signal.0))
            .is_some_and(|list| list.contains(prio))
    }

    /// Snapshot of the subscribers of `signal`.
    pub fn subscribers(&self, signal: Signal) -> PrioSet {
        require(signal.0 < self.max_signal(), MODULE, 200);
        self.lists[usize::from(signal.0)]
    }

    fn is_user_signal(&self, signal: Signal) -> bool {
        signal.is_user() && signal.0 < self.max_signal()
    }
}

fn is_object_prio(prio: u8) -> bool {
    (1..=MAX_PRIO).contains(&prio)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALARM: Signal = Signal(8);
    const RESET: Signal = Signal(9);

    #[test]
    fn subscribers_are_kept_per_signal() {
        let mut table = Subscriptions::new(16);
        table.subscribe(ALARM, 3);
        table.subscribe(ALARM, 12);
        table.subscribe(RESET, 3);

        let alarm = table.subscribers(ALARM);
        assert_eq!(alarm.find_max(), Some(12));
        assert!(alarm.contains(3));
        assert!(table.is_subscribed(RESET, 3));
        assert!(!table.is_subscribed(RESET, 12));

        table.unsubscribe(ALARM, 12);
        assert_eq!(table.subscribers(ALARM).find_max(), Some(3));
    }

    #[test]
    fn unsubscribe_all_clears_every_signal() {
        let mut table = Subscriptions::new(16);
        table.subscribe(ALARM, 5);
        table.subscribe(RESET, 5);
        table.subscribe(RESET, 6);

        table.unsubscribe_all(5);
        assert!(table.subscribers(ALARM).is_empty());
        assert_eq!(table.subscribers(RESET).find_max(), Some(6));
        assert!(!table.is_subscribed(Signal(40), 6));
    }

    #[test]
    #[should_panic(expected = "assertion failed in qf_ps at location 300")]
    fn reserved_signal_cannot_be_subscribed() {
        Subscriptions::new(16).subscribe(Signal::TIMEOUT, 2);
    }

    #[test]
    #[should_panic(expected = "assertion failed in qf_ps at location 200")]
    fn publishing_past_the_table_faults() {
        Subscriptions::new(16).subscribers(Signal(16));
    }
}
