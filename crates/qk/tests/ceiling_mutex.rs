//! Priority-ceiling behavior of `QkMutex` across preempting objects.

use std::sync::{Arc, Mutex};

use qf::{ActiveBehavior, ActiveContext, ActiveObjectId, DynEvent, Signal};
use qk::{QkKernel, QkMutex};

const HOLDER: ActiveObjectId = ActiveObjectId::new(3);
const MIDDLE: ActiveObjectId = ActiveObjectId::new(7);
const URGENT: ActiveObjectId = ActiveObjectId::new(12);

const GO: Signal = Signal(0x10);
const PING: Signal = Signal(0x11);

type Trace = Arc<Mutex<Vec<String>>>;

struct Holder {
    mutex: Arc<QkMutex>,
    trace: Trace,
    depth: u8,
}

impl ActiveBehavior<QkKernel> for Holder {
    fn on_event(&mut self, ctx: &mut ActiveContext<'_, QkKernel>, _event: DynEvent) {
        let kernel = ctx.kernel();
        for _ in 0..self.depth {
            self.mutex.lock(kernel);
        }
        self.trace.lock().unwrap().push("locked".into());

        kernel.post(MIDDLE, DynEvent::empty_dyn(PING));
        kernel.post(URGENT, DynEvent::empty_dyn(PING));
        self.trace.lock().unwrap().push("posted".into());

        for remaining in (0..self.depth).rev() {
            self.mutex.unlock(kernel);
            assert_eq!(self.mutex.is_held(), remaining != 0);
        }
        self.trace.lock().unwrap().push("unlocked".into());
    }
}

struct Named {
    name: &'static str,
    trace: Trace,
}

impl ActiveBehavior<QkKernel> for Named {
    fn on_event(&mut self, _ctx: &mut ActiveContext<'_, QkKernel>, _event: DynEvent) {
        self.trace.lock().unwrap().push(self.name.into());
    }
}

fn run_holder(ceiling: u8, depth: u8) -> Vec<String> {
    let trace = Trace::default();
    let mutex = Arc::new(QkMutex::new(ceiling));
    let kernel = QkKernel::builder()
        .register(
            HOLDER,
            3,
            4,
            Holder {
                mutex: Arc::clone(&mutex),
                trace: Arc::clone(&trace),
                depth,
            },
        )
        .unwrap()
        .register(MIDDLE, 7, 4, Named { name: "middle", trace: Arc::clone(&trace) })
        .unwrap()
        .register(URGENT, 12, 4, Named { name: "urgent", trace: Arc::clone(&trace) })
        .unwrap()
        .build();
    kernel.start();
    kernel.post(HOLDER, DynEvent::empty_dyn(GO));
    assert!(!mutex.is_held());
    assert_eq!(kernel.lock_ceiling(), 0);
    let result = trace.lock().unwrap().clone();
    result
}

#[test]
fn ceiling_holds_back_priorities_up_to_the_ceiling() {
    assert_eq!(
        run_holder(10, 1),
        vec!["locked", "urgent", "posted", "middle", "unlocked"]
    );
}

#[test]
fn recursive_locking_releases_on_balancing_unlock() {
    assert_eq!(
        run_holder(10, 3),
        vec!["locked", "urgent", "posted", "middle", "unlocked"]
    );
}

#[test]
fn zero_ceiling_is_a_plain_nesting_lock() {
    assert_eq!(
        run_holder(0, 2),
        vec!["locked", "middle", "urgent", "posted", "unlocked"]
    );
}

#[test]
#[should_panic(expected = "qk_mutex")]
fn unlock_past_balance_faults() {
    let kernel = QkKernel::builder().build();
    kernel.start();
    let mutex = QkMutex::new(4);
    mutex.lock(&kernel);
    mutex.unlock(&kernel);
    mutex.unlock(&kernel);
}

#[test]
fn idle_context_can_hold_the_mutex() {
    let trace = Trace::default();
    let kernel = QkKernel::builder()
        .register(MIDDLE, 7, 4, Named { name: "middle", trace: Arc::clone(&trace) })
        .unwrap()
        .build();
    kernel.start();

    let mutex = QkMutex::new(8);
    mutex.lock(&kernel);
    mutex.lock(&kernel);
    assert_eq!(mutex.nesting(), 2);
    kernel.post(MIDDLE, DynEvent::empty_dyn(PING));
    assert!(trace.lock().unwrap().is_empty());

    mutex.unlock(&kernel);
    assert!(trace.lock().unwrap().is_empty());
    mutex.unlock(&kernel);
    assert_eq!(*trace.lock().unwrap(), vec!["middle"]);
}
