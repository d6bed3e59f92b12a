use log::trace;
use qf::{ActiveObjectId, DynEvent, Signal, TimerHost, TimerWheel, NO_MARGIN};

use crate::kernel::{Member, QxkKernel};

impl QxkKernel {
    /// Clock tick for `tick_rate`, run as an ISR. Expired thread timeouts
    /// wake their threads in the same critical section as the wheel walk;
    /// other expirations are posted afterwards.
    pub fn tick(&self, tick_rate: u8) {
        self.isr(|kernel| {
            let mut expired = Vec::new();
            let mut posts = Vec::new();
            let mut state = kernel.state.lock();
            state.timers.tick(tick_rate, &mut expired);
            for item in expired {
                match kernel.member(item.target) {
                    Member::Thread(index) if item.signal == Signal::TIMEOUT => {
                        trace!(target: "qxk::time", "timeout of thread #{index}");
                        state.expire_timeout(index);
                    }
                    _ => posts.push(item),
                }
            }
            drop(state);

            for item in posts {
                trace!(target: "qxk::time", "te#{} fired {}", item.id.index(), item.signal);
                kernel.post_fifo(item.target, DynEvent::empty_dyn(item.signal), NO_MARGIN);
            }
        });
    }

    /// True when no time event is armed at `tick_rate`.
    pub fn no_time_events_active(&self, tick_rate: u8) -> bool {
        self.state.lock().timers.no_active(tick_rate)
    }
}

impl TimerHost for QxkKernel {
    fn with_timers<R>(&self, f: impl FnOnce(&mut TimerWheel) -> R) -> R {
        f(&mut self.state.lock().timers)
    }

    fn has_target(&self, target: ActiveObjectId) -> bool {
        self.contains(target)
    }
}
