use log::trace;
use qf::{ActiveObjectId, DynEvent, TimerHost, TimerWheel, NO_MARGIN};

use crate::kernel::QkKernel;

impl QkKernel {
    /// Clock tick for `tick_rate`, run as an ISR. Expired time events are
    /// posted after the wheel has been walked; activations happen on the
    /// ISR exit.
    pub fn tick(&self, tick_rate: u8) {
        self.isr(|kernel| {
            let mut expired = Vec::new();
            kernel.state.lock().timers.tick(tick_rate, &mut expired);
            for item in expired {
                trace!(target: "qk::time", "te#{} fired {}", item.id.index(), item.signal);
                kernel.post_fifo(item.target, DynEvent::empty_dyn(item.signal), NO_MARGIN);
            }
        });
    }

    /// True when no time event is armed at `tick_rate`.
    pub fn no_time_events_active(&self, tick_rate: u8) -> bool {
        self.state.lock().timers.no_active(tick_rate)
    }
}

impl TimerHost for QkKernel {
    fn with_timers<R>(&self, f: impl FnOnce(&mut TimerWheel) -> R) -> R {
        f(&mut self.state.lock().timers)
    }

    fn has_target(&self, target: ActiveObjectId) -> bool {
        self.contains(target)
    }
}
