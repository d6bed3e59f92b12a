//! Example demonstrating QXK synchronization primitives.
//!
//! Walks through a counting semaphore, a binary semaphore used as a signal
//! flag, a recursive ceiling mutex taken from a basic thread, a timed
//! semaphore wait and a cancelled delay.

use std::sync::{Arc, Mutex};

use qf::{ActiveBehavior, ActiveContext, ActiveObjectId, DynEvent, Signal};
use qxk::{CeilingMutex, QxkKernel, Semaphore, SyncError, ThreadConfig};

const SLEEPER: ActiveObjectId = ActiveObjectId::new(1);
const WAITER: ActiveObjectId = ActiveObjectId::new(2);
const LOCKER: ActiveObjectId = ActiveObjectId::new(3);

fn main() {
    println!("=== QXK Synchronization Primitives Demo ===\n");

    demo_semaphore();
    demo_binary_semaphore();
    demo_mutex();
    demo_timeouts();
}

fn idle_kernel() -> Arc<QxkKernel> {
    let kernel = QxkKernel::builder().build();
    kernel.start();
    kernel
}

fn demo_semaphore() {
    println!("1. Semaphore Example");
    println!("   - Counting semaphore for resource management");

    let kernel = idle_kernel();
    let sem = Semaphore::new(3, 3);
    println!("   Initial count: {}", sem.count());

    sem.try_wait(&kernel);
    sem.try_wait(&kernel);
    println!("   After 2 acquisitions: {}", sem.count());

    sem.signal(&kernel).expect("below max count");
    println!("   After 1 release: {}\n", sem.count());
}

fn demo_binary_semaphore() {
    println!("2. Binary Semaphore Example");
    println!("   - Acts like a signal flag");

    let kernel = idle_kernel();
    let sem = Semaphore::new(0, 1);

    assert!(!sem.try_wait(&kernel));
    println!("   Initial wait failed (expected)");

    sem.signal(&kernel).expect("flag was clear");
    assert_eq!(sem.signal(&kernel), Err(SyncError::Overflow));
    println!("   Second signal refused (overflow protection)");

    assert!(sem.try_wait(&kernel));
    println!("   Wait succeeded (count=0)\n");
}

struct Locker {
    mutex: CeilingMutex,
}

impl ActiveBehavior<QxkKernel> for Locker {
    fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, _event: DynEvent) {
        let kernel = ctx.kernel();
        assert!(self.mutex.try_lock(kernel));
        assert!(self.mutex.try_lock(kernel));
        println!(
            "   Basic thread at prio {} runs at {} (nesting {})",
            ctx.priority(),
            kernel.current_priority(),
            self.mutex.nesting()
        );
        self.mutex.unlock(kernel);
        self.mutex.unlock(kernel);
        println!("   Released, back at {}", kernel.current_priority());
    }
}

fn demo_mutex() {
    println!("3. Ceiling Mutex Example");
    println!("   - Recursive locking with a priority ceiling");

    let mutex = CeilingMutex::new(6);
    let kernel = QxkKernel::builder()
        .register_ao(LOCKER, 2, 2, Locker { mutex: mutex.clone() })
        .expect("register locker")
        .register_mutex(&mutex)
        .expect("reserve ceiling")
        .build();
    kernel.start();
    kernel.post(LOCKER, DynEvent::empty_dyn(Signal(20)));
    println!();
}

fn demo_timeouts() {
    println!("4. Timeouts Example");
    println!("   - Timed semaphore wait and cancelled delay");

    let results = Arc::new(Mutex::new(Vec::new()));
    let sem = Semaphore::new(0, 1);

    let waiter = {
        let results = Arc::clone(&results);
        ThreadConfig::new(WAITER, 3, move |me| {
            let outcome = sem.wait(me.kernel(), 2);
            results.lock().unwrap().push(format!("wait: {outcome:?}"));
        })
    };
    let sleeper = {
        let results = Arc::clone(&results);
        ThreadConfig::new(SLEEPER, 4, move |me| {
            let outcome = me.delay(100);
            results.lock().unwrap().push(format!("delay: {outcome:?}"));
        })
    };

    let kernel = QxkKernel::builder()
        .register_thread(waiter)
        .expect("register waiter")
        .register_thread(sleeper)
        .expect("register sleeper")
        .build();
    kernel.start();

    kernel.tick(0);
    kernel.tick(0);
    kernel.delay_cancel(SLEEPER);

    for line in results.lock().unwrap().iter() {
        println!("   {line}");
    }
}
