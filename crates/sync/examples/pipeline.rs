//! Producer-consumer pipeline over a typed queue.
//!
//! A producer task queues numbered items and sleeps one tick between
//! them; a more urgent consumer drains the queue, pending on it when it
//! runs dry. The main loop stands in for a hardware tick interrupt.

use std::sync::Arc;

use parking_lot::Mutex;
use tickos_kernel::{Kernel, KernelConfig, MAX_DELAY};
use tickos_sync::Queue;

const ITEMS: u32 = 10;

fn main() {
    let kernel = Kernel::new(KernelConfig::builder().preemptive(true).build());
    let queue: Arc<Queue<u32>> = Arc::new(Queue::new(&kernel, 4));

    let consumed = Arc::new(Mutex::new(0u32));
    let cons_queue = Arc::clone(&queue);
    let cons_count = Arc::clone(&consumed);
    kernel
        .create_task(0, move |_| {
            if let Some(item) = cons_queue.read_pend(MAX_DELAY) {
                *cons_count.lock() += 1;
                println!("consumer: received item #{item}");
            }
        })
        .expect("consumer priority is free");

    let produced = Arc::new(Mutex::new(0u32));
    let prod_queue = Arc::clone(&queue);
    let prod_count = Arc::clone(&produced);
    kernel
        .create_task(1, move |k| {
            let item = {
                let mut count = prod_count.lock();
                if *count == ITEMS {
                    None
                } else {
                    *count += 1;
                    Some(*count)
                }
            };
            match item {
                None => {
                    println!("producer: finished");
                    k.delay(MAX_DELAY);
                }
                Some(item) => {
                    if prod_queue.write_pend(item, MAX_DELAY).is_ok() {
                        println!("producer: queued item #{item}");
                        k.delay(1);
                    } else {
                        // Queue full; retry this item once a slot frees up.
                        *prod_count.lock() -= 1;
                    }
                }
            }
        })
        .expect("producer priority is free");

    kernel.start();
    kernel.schedule();
    for _ in 0..2 * ITEMS {
        kernel.tick();
        kernel.schedule();
    }

    println!(
        "pipeline done: produced {}, consumed {}",
        produced.lock(),
        consumed.lock()
    );
}
