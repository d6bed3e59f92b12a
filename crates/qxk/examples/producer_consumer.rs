//! Producer-consumer example demonstrating QXK thread coordination.
//!
//! A producer thread fills a bounded buffer guarded by a ceiling mutex and
//! two counting semaphores; a consumer thread drains it. A basic thread
//! (active object) receives a summary event from the consumer. The main
//! thread drives the clock and stops once everything is consumed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use qf::{ActiveBehavior, ActiveContext, ActiveObjectId, DynEvent, Signal};
use qxk::{CeilingMutex, QxkKernel, Semaphore, ThreadConfig, NO_TIMEOUT};

const PRODUCER: ActiveObjectId = ActiveObjectId::new(1);
const CONSUMER: ActiveObjectId = ActiveObjectId::new(2);
const REPORTER: ActiveObjectId = ActiveObjectId::new(3);

const DONE_SIG: Signal = Signal(10);
const ITEMS: usize = 10;
const SLOTS: u16 = 4;

struct Reporter;

impl ActiveBehavior<QxkKernel> for Reporter {
    fn on_event(&mut self, ctx: &mut ActiveContext<'_, QxkKernel>, event: DynEvent) {
        if let Some(total) = event.payload_ref::<usize>() {
            println!("Reporter: consumer finished, sum = {total}");
        }
        ctx.kernel().stop();
    }
}

fn main() {
    println!("=== QXK Producer-Consumer Example ===\n");

    let buffer = Arc::new(Mutex::new(VecDeque::new()));
    let guard = CeilingMutex::new(8);
    let empty_slots = Semaphore::new(SLOTS, SLOTS);
    let full_slots = Semaphore::new(0, SLOTS);

    let producer = {
        let buffer = Arc::clone(&buffer);
        let guard = guard.clone();
        let empty_slots = empty_slots.clone();
        let full_slots = full_slots.clone();
        ThreadConfig::new(PRODUCER, 2, move |me| {
            let kernel = me.kernel();
            for item in 1..=ITEMS {
                empty_slots.wait(kernel, NO_TIMEOUT).expect("no timeout requested");
                guard.lock(kernel, NO_TIMEOUT).expect("no timeout requested");
                buffer.lock().unwrap().push_back(item);
                guard.unlock(kernel);
                println!("Producer: created item #{item}");
                full_slots.signal(kernel).expect("one signal per free slot");
                if item < ITEMS {
                    // pace production with the clock
                    me.delay(1).expect("nobody cancels the producer");
                }
            }
            println!("Producer: finished ({ITEMS} items)");
        })
        .with_stack_size(16 * 1024)
    };

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let guard = guard.clone();
        ThreadConfig::new(CONSUMER, 3, move |me| {
            let kernel = me.kernel();
            let mut sum = 0;
            for _ in 0..ITEMS {
                full_slots.wait(kernel, NO_TIMEOUT).expect("no timeout requested");
                guard.lock(kernel, NO_TIMEOUT).expect("no timeout requested");
                let item = buffer.lock().unwrap().pop_front().unwrap_or_default();
                guard.unlock(kernel);
                empty_slots.signal(kernel).expect("one signal per taken slot");
                println!("Consumer: took item #{item}");
                sum += item;
            }
            kernel.post(REPORTER, DynEvent::with_payload(DONE_SIG, sum));
        })
    };

    let kernel = QxkKernel::builder()
        .register_thread(producer)
        .expect("register producer")
        .register_thread(consumer)
        .expect("register consumer")
        .register_ao(REPORTER, 5, 4, Reporter)
        .expect("register reporter")
        .register_mutex(&guard)
        .expect("reserve ceiling")
        .build();
    kernel.run(|k| k.tick(0));
    println!("\n=== Done ===");
}
