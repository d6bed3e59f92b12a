//! Ready-priority map.
//!
//! A two-level bitmap over priorities `1..=MAX_PRIO`. Bit `g` of the group
//! word is set while the `g`-th 32-bit priority word is non-empty, so
//! [`PrioSet::find_max`] costs two leading-zero counts no matter how many
//! priorities are configured. Priority 0 means "idle" and is never stored.

use crate::assert::require;

const MODULE: &str = "qf_pset";

/// Highest priority the kernels support.
pub const MAX_PRIO: u8 = 64;

const WORD_BITS: u8 = 32;
const GROUPS: usize = (MAX_PRIO as usize + WORD_BITS as usize - 1) / WORD_BITS as usize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrioSet {
    groups: u32,
    words: [u32; GROUPS],
}

impl PrioSet {
    pub const fn new() -> Self {
        Self {
            groups: 0,
            words: [0; GROUPS],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups == 0
    }

    pub fn contains(&self, prio: u8) -> bool {
        let (group, mask) = Self::locate(prio);
        self.words[group] & mask != 0
    }

    pub fn insert(&mut self, prio: u8) {
        let (group, mask) = Self::locate(prio);
        self.words[group] |= mask;
        self.groups |= 1 << group;
    }

    pub fn remove(&mut self, prio: u8) {
        let (group, mask) = Self::locate(prio);
        self.words[group] &= !mask;
        if self.words[group] == 0 {
            self.groups &= !(1 << group);
        }
    }

    /// Highest priority in the set, or `None` when empty.
    pub fn find_max(&self) -> Option<u8> {
        if self.groups == 0 {
            return None;
        }
        let group = (u32::BITS - 1 - self.groups.leading_zeros()) as usize;
        let bit = (u32::BITS - 1 - self.words[group].leading_zeros()) as u8;
        Some(group as u8 * WORD_BITS + bit + 1)
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn locate(prio: u8) -> (usize, u32) {
        require((1..=MAX_PRIO).contains(&prio), MODULE, 100);
        let index = prio - 1;
        ((index / WORD_BITS) as usize, 1u32 << (index % WORD_BITS))
    }
}
