//! Priority-ceiling mutex for basic threads.
//!
//! Locking raises the scheduler lock ceiling to the mutex ceiling, so no
//! basic thread at or below the ceiling can preempt the holder, while
//! higher-priority objects keep running. The mutex is recursive; only the
//! unlock that balances the first lock restores the saved ceiling and runs a
//! scheduling pass. A ceiling of 0 gives a plain nesting lock.

use qf::assert::{on_assert, require};
use qf::sync::Mutex;

use crate::kernel::QkKernel;
use crate::scheduler::SchedStatus;

const MODULE: &str = "qk_mutex";

#[derive(Debug)]
struct Owner {
    holder: u8,
    nest: u8,
    saved: SchedStatus,
}

#[derive(Debug)]
pub struct QkMutex {
    ceiling: u8,
    owner: Mutex<Option<Owner>>,
}

impl QkMutex {
    pub fn new(ceiling: u8) -> Self {
        Self {
            ceiling,
            owner: Mutex::new(None),
        }
    }

    pub fn ceiling(&self) -> u8 {
        self.ceiling
    }

    pub fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Current recursion depth, 0 when free.
    pub fn nesting(&self) -> u8 {
        self.owner.lock().as_ref().map_or(0, |owner| owner.nest)
    }

    pub fn lock(&self, kernel: &QkKernel) {
        require(!kernel.is_isr_context(), MODULE, 100);
        let me = kernel.current_priority();
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            None => {
                let saved = kernel.sched_lock(self.ceiling);
                *owner = Some(Owner {
                    holder: me,
                    nest: 1,
                    saved,
                });
            }
            Some(current) if current.holder == me => {
                require(current.nest < u8::MAX, MODULE, 110);
                current.nest += 1;
            }
            Some(_) => on_assert(MODULE, 120),
        }
    }

    pub fn unlock(&self, kernel: &QkKernel) {
        require(!kernel.is_isr_context(), MODULE, 200);
        let me = kernel.current_priority();
        let saved = {
            let mut owner = self.owner.lock();
            let current = match owner.as_mut() {
                Some(current) if current.holder == me => current,
                _ => on_assert(MODULE, 210),
            };
            current.nest -= 1;
            if current.nest != 0 {
                return;
            }
            let saved = current.saved;
            *owner = None;
            saved
        };
        kernel.sched_unlock(saved);
    }
}
