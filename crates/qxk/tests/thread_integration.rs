//! Integration tests for QXK extended threads with blocking primitives.

use std::sync::{Arc, Mutex};

use qf::{ActiveBehavior, ActiveContext, ActiveObjectId, DynEvent, Signal};
use qxk::{CeilingMutex, QxkKernel, Semaphore, SyncError, ThreadConfig, NO_TIMEOUT};

type Trace = Arc<Mutex<Vec<String>>>;

fn note(trace: &Trace, entry: impl Into<String>) {
    trace.lock().unwrap().push(entry.into());
}

fn entries(trace: &Trace) -> Vec<String> {
    let entries = trace.lock().unwrap().clone();
    entries
}

struct Note {
    name: &'static str,
    trace: Trace,
}

impl ActiveBehavior<QxkKernel> for Note {
    fn on_event(&mut self, _ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
        note(&self.trace, self.name);
    }
}

const HOLDER: ActiveObjectId = ActiveObjectId::new(1);
const MIDDLE: ActiveObjectId = ActiveObjectId::new(2);
const URGENT: ActiveObjectId = ActiveObjectId::new(3);
const WORKER: ActiveObjectId = ActiveObjectId::new(4);

#[test]
fn ceiling_holds_back_mid_priority_thread() {
    let trace = Trace::default();
    let mutex = CeilingMutex::new(10);
    let go = Semaphore::new(0, 1);

    let middle = {
        let trace = Arc::clone(&trace);
        let go = go.clone();
        ThreadConfig::new(MIDDLE, 7, move |me| {
            go.wait(me.kernel(), NO_TIMEOUT).expect("signaled");
            note(&trace, "middle");
        })
    };
    let holder = {
        let trace = Arc::clone(&trace);
        let mutex = mutex.clone();
        ThreadConfig::new(HOLDER, 3, move |me| {
            let kernel = me.kernel();
            mutex.lock(kernel, NO_TIMEOUT).expect("free mutex");
            assert_eq!(me.priority(), 10);
            go.signal(kernel).expect("room for one");
            note(&trace, "signaled");
            kernel.post(URGENT, DynEvent::empty_dyn(Signal(50)));
            note(&trace, "posted");
            mutex.unlock(kernel);
            note(&trace, "unlocked");
            assert_eq!(me.priority(), 3);
        })
    };

    let kernel = QxkKernel::builder()
        .register_thread(middle)
        .unwrap()
        .register_thread(holder)
        .unwrap()
        .register_ao(URGENT, 12, 4, Note { name: "urgent", trace: Arc::clone(&trace) })
        .unwrap()
        .register_mutex(&mutex)
        .unwrap()
        .build();
    kernel.start();

    assert_eq!(
        entries(&trace),
        vec!["signaled", "urgent", "posted", "middle", "unlocked"]
    );
    assert!(kernel.is_terminated(HOLDER));
    assert!(kernel.is_terminated(MIDDLE));
    assert!(!mutex.is_held());
}

#[test]
fn recursive_lock_releases_on_outermost_unlock() {
    let mutex = CeilingMutex::new(8);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let mutex = mutex.clone();
        let seen = Arc::clone(&seen);
        ThreadConfig::new(WORKER, 2, move |me| {
            let kernel = me.kernel();
            mutex.lock(kernel, NO_TIMEOUT).unwrap();
            mutex.lock(kernel, NO_TIMEOUT).unwrap();
            assert!(mutex.try_lock(kernel));
            seen.lock().unwrap().push((mutex.nesting(), me.priority()));
            mutex.unlock(kernel);
            mutex.unlock(kernel);
            seen.lock().unwrap().push((mutex.nesting(), me.priority()));
            mutex.unlock(kernel);
            seen.lock().unwrap().push((mutex.nesting(), me.priority()));
        })
    };
    let kernel = QxkKernel::builder()
        .register_thread(worker)
        .unwrap()
        .register_mutex(&mutex)
        .unwrap()
        .build();
    kernel.start();

    assert_eq!(*seen.lock().unwrap(), vec![(3, 8), (1, 8), (0, 2)]);
}

#[test]
fn blocked_contender_receives_mutex_on_unlock() {
    let trace = Trace::default();
    let mutex = CeilingMutex::new(10);

    let low = {
        let trace = Arc::clone(&trace);
        let mutex = mutex.clone();
        ThreadConfig::new(HOLDER, 2, move |me| {
            mutex.lock(me.kernel(), NO_TIMEOUT).unwrap();
            me.delay(2).expect("delay runs out");
            note(&trace, "low unlocks");
            mutex.unlock(me.kernel());
            note(&trace, "low done");
        })
    };
    let high = {
        let trace = Arc::clone(&trace);
        let mutex = mutex.clone();
        ThreadConfig::new(WORKER, 5, move |me| {
            // let the low thread take the mutex first
            me.delay(1).unwrap();
            note(&trace, "high waits");
            mutex.lock(me.kernel(), NO_TIMEOUT).unwrap();
            note(&trace, format!("high holds at {}", me.priority()));
            mutex.unlock(me.kernel());
        })
    };

    let kernel = QxkKernel::builder()
        .register_thread(low)
        .unwrap()
        .register_thread(high)
        .unwrap()
        .register_mutex(&mutex)
        .unwrap()
        .build();
    kernel.start();
    assert!(entries(&trace).is_empty());

    kernel.tick(0);
    assert_eq!(entries(&trace), vec!["high waits"]);

    kernel.tick(0);
    assert_eq!(
        entries(&trace),
        vec!["high waits", "low unlocks", "high holds at 10", "low done"]
    );
    assert!(!mutex.is_held());
}

#[test]
fn mutex_wait_times_out() {
    let outcome = Arc::new(Mutex::new(None));
    let mutex = CeilingMutex::new(0);

    let low = {
        let mutex = mutex.clone();
        ThreadConfig::new(HOLDER, 2, move |me| {
            mutex.lock(me.kernel(), NO_TIMEOUT).unwrap();
            me.delay(5).unwrap();
            mutex.unlock(me.kernel());
        })
    };
    let high = {
        let mutex = mutex.clone();
        let outcome = Arc::clone(&outcome);
        ThreadConfig::new(WORKER, 5, move |me| {
            me.delay(1).unwrap();
            let locked = mutex.lock(me.kernel(), 2);
            *outcome.lock().unwrap() = Some(locked);
        })
    };

    let kernel = QxkKernel::builder()
        .register_thread(low)
        .unwrap()
        .register_thread(high)
        .unwrap()
        .build();
    kernel.start();

    kernel.tick(0);
    kernel.tick(0);
    assert_eq!(*outcome.lock().unwrap(), None);
    kernel.tick(0);
    assert_eq!(*outcome.lock().unwrap(), Some(Err(SyncError::Timeout)));
    assert!(mutex.is_held());
}

type Outcome = Arc<Mutex<Option<Result<(), SyncError>>>>;

fn semaphore_waiter(sem: &Semaphore, result: &Outcome) -> ThreadConfig {
    let sem = sem.clone();
    let result = Arc::clone(result);
    ThreadConfig::new(WORKER, 4, move |me| {
        let waited = sem.wait(me.kernel(), 5);
        *result.lock().unwrap() = Some(waited);
    })
}

#[test]
fn semaphore_wait_times_out_after_five_ticks() {
    let sem = Semaphore::new(0, 1);
    let result = Arc::new(Mutex::new(None));
    let kernel = QxkKernel::builder()
        .register_thread(semaphore_waiter(&sem, &result))
        .unwrap()
        .build();
    kernel.start();

    for _ in 0..4 {
        kernel.tick(0);
    }
    assert_eq!(*result.lock().unwrap(), None);

    kernel.tick(0);
    assert_eq!(*result.lock().unwrap(), Some(Err(SyncError::Timeout)));
    assert_eq!(sem.count(), 0);
}

#[test]
fn semaphore_signal_at_tick_three_wakes_waiter() {
    let sem = Semaphore::new(0, 1);
    let result = Arc::new(Mutex::new(None));
    let kernel = QxkKernel::builder()
        .register_thread(semaphore_waiter(&sem, &result))
        .unwrap()
        .build();
    kernel.start();

    for _ in 0..3 {
        kernel.tick(0);
    }
    sem.signal(&kernel).unwrap();
    assert_eq!(*result.lock().unwrap(), Some(Ok(())));
    // the waiter consumed the count it was handed
    assert_eq!(sem.count(), 0);
    assert!(kernel.no_time_events_active(0));
}

#[test]
fn semaphore_serves_highest_waiter_first() {
    let trace = Trace::default();
    let sem = Semaphore::new(0, 2);
    let waiter = |id: u8, prio: u8| {
        let sem = sem.clone();
        let trace = Arc::clone(&trace);
        ThreadConfig::new(ActiveObjectId::new(id), prio, move |me| {
            sem.wait(me.kernel(), NO_TIMEOUT).unwrap();
            note(&trace, format!("prio {}", me.priority()));
        })
    };
    let kernel = QxkKernel::builder()
        .register_thread(waiter(10, 3))
        .unwrap()
        .register_thread(waiter(11, 6))
        .unwrap()
        .build();
    kernel.start();

    sem.signal(&kernel).unwrap();
    assert_eq!(entries(&trace), vec!["prio 6"]);
    sem.signal(&kernel).unwrap();
    assert_eq!(entries(&trace), vec!["prio 6", "prio 3"]);
}

#[test]
fn queue_get_times_out_empty_handed() {
    let outcome = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let outcome = Arc::clone(&outcome);
        ThreadConfig::new(WORKER, 3, move |me| {
            let first = me.queue_get(2).map(|event| event.signal());
            outcome.lock().unwrap().push(first);
            let second = me.queue_get(2).map(|event| event.signal());
            outcome.lock().unwrap().push(second);
        })
        .with_queue(3)
    };
    let kernel = QxkKernel::builder()
        .register_thread(worker)
        .unwrap()
        .build();
    kernel.start();

    kernel.tick(0);
    kernel.tick(0);
    assert_eq!(*outcome.lock().unwrap(), vec![None]);

    kernel.post(WORKER, DynEvent::empty_dyn(Signal(60)));
    assert_eq!(*outcome.lock().unwrap(), vec![None, Some(Signal(60))]);
    assert!(kernel.is_terminated(WORKER));
}

#[test]
fn delay_completes_or_is_canceled() {
    let outcome = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let outcome = Arc::clone(&outcome);
        ThreadConfig::new(WORKER, 3, move |me| {
            let first = me.delay(2);
            outcome.lock().unwrap().push(first);
            let second = me.delay(10);
            outcome.lock().unwrap().push(second);
        })
    };
    let kernel = QxkKernel::builder()
        .register_thread(worker)
        .unwrap()
        .build();
    kernel.start();

    kernel.tick(0);
    assert!(outcome.lock().unwrap().is_empty());
    kernel.tick(0);
    assert_eq!(*outcome.lock().unwrap(), vec![Ok(())]);

    assert!(kernel.delay_cancel(WORKER));
    assert_eq!(*outcome.lock().unwrap(), vec![Ok(()), Err(SyncError::Canceled)]);
    assert!(!kernel.delay_cancel(WORKER));
    assert!(kernel.no_time_events_active(0));
}

#[test]
fn run_loop_drives_ticks_until_stopped() {
    let done = Arc::new(Mutex::new(false));
    let worker = {
        let done = Arc::clone(&done);
        ThreadConfig::new(WORKER, 3, move |me| {
            me.delay(3).unwrap();
            *done.lock().unwrap() = true;
            me.kernel().stop();
        })
    };
    let kernel = QxkKernel::builder()
        .register_thread(worker)
        .unwrap()
        .build();

    let mut ticks = 0;
    kernel.run(|k| {
        ticks += 1;
        k.tick(0);
    });
    assert!(*done.lock().unwrap());
    assert_eq!(ticks, 3);
}

#[test]
#[should_panic(expected = "worker gave up")]
fn thread_panic_surfaces_on_the_basic_context() {
    let worker = ThreadConfig::new(WORKER, 3, |_| panic!("worker gave up"));
    let kernel = QxkKernel::builder()
        .register_thread(worker)
        .unwrap()
        .build();
    kernel.start();
}

/// Sets its flag when the owning thread's stack is unwound.
struct Released(Arc<Mutex<bool>>);

impl Drop for Released {
    fn drop(&mut self) {
        *self.0.lock().unwrap() = true;
    }
}

#[test]
fn shutdown_ends_parked_threads() {
    let trace = Trace::default();
    let released = Arc::new(Mutex::new(false));
    let sem = Semaphore::new(0, 1);
    let listener = {
        let trace = Arc::clone(&trace);
        let released = Arc::clone(&released);
        ThreadConfig::new(WORKER, 3, move |me| {
            let _released = Released(released);
            me.queue_get(NO_TIMEOUT);
            note(&trace, "listener resumed");
        })
        .with_queue(2)
    };
    let waiter = {
        let trace = Arc::clone(&trace);
        let sem = sem.clone();
        ThreadConfig::new(HOLDER, 5, move |me| {
            let _ = sem.wait(me.kernel(), NO_TIMEOUT);
            note(&trace, "waiter resumed");
        })
    };
    let kernel = QxkKernel::builder()
        .register_thread(listener)
        .unwrap()
        .register_thread(waiter)
        .unwrap()
        .build();
    kernel.start();
    assert!(Arc::strong_count(&kernel) > 1);

    kernel.shutdown();
    assert!(*released.lock().unwrap());
    assert!(entries(&trace).is_empty());
    assert_eq!(Arc::strong_count(&kernel), 1);
    assert!(!kernel.is_terminated(WORKER));

    // a second call has nothing left to do
    kernel.shutdown();
}

#[test]
#[should_panic(expected = "assertion failed in qxk at location 710")]
fn retired_thread_cannot_be_woken() {
    let worker = ThreadConfig::new(WORKER, 3, |me| {
        me.queue_get(NO_TIMEOUT);
    })
    .with_queue(2);
    let kernel = QxkKernel::builder().register_thread(worker).unwrap().build();
    kernel.start();
    kernel.shutdown();
    kernel.post(WORKER, DynEvent::empty_dyn(Signal(80)));
}
