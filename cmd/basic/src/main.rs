//! Basic strand example
//!
//! Demonstrates spawning fibers, cooperative yields, and sleeping
//! through the intercepted poll.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sleep the calling fiber via poll(nfds=0) - the runtime parks it on a
/// one-shot timer instead of blocking the worker thread.
fn fiber_sleep_ms(ms: i32) {
    unsafe {
        libc::poll(std::ptr::null_mut(), 0, ms);
    }
}

fn main() {
    println!("=== strand basic example ===\n");

    let completed = Arc::new(AtomicUsize::new(0));
    let total = 3;

    for id in 0..total {
        let done = completed.clone();
        strand::spawn(move || {
            println!("[fiber {}] started", id);
            for round in 0..3 {
                println!("[fiber {}] round {}", id, round);
                strand::yield_now();
            }
            // Sleep without holding a worker hostage.
            fiber_sleep_ms(10 * (id as i32 + 1));
            println!("[fiber {}] finished", id);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    strand::start_loop().expect("runtime startup failed");
    strand::stop_loop().expect("runtime shutdown failed");

    println!("\n{}/{} fibers completed", completed.load(Ordering::SeqCst), total);
}
