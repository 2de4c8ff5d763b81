//! Graceful shutdown: N fibers sleep via poll and exit; the runtime
//! drains itself and stop_loop returns with every fiber accounted for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn fiber_sleep_ms(ms: i32) {
    let ret = unsafe { libc::poll(std::ptr::null_mut(), 0, ms) };
    assert_eq!(ret, 0, "timed poll with no fds must report timeout");
}

#[test]
fn shutdown_after_all_fibers_exit() {
    const FIBERS: usize = 32;
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..FIBERS {
        let done = completed.clone();
        strand::spawn(move || {
            // A couple of voluntary yields, then a timed sleep, as a
            // minimal life story for a fiber.
            strand::yield_now();
            strand::yield_now();
            fiber_sleep_ms(10);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    strand::start_loop().expect("start_loop failed");
    strand::stop_loop().expect("stop_loop failed");

    // stop_loop returning proves the workers and the event loop saw the
    // live count hit zero; the counter proves each fiber ran to its end.
    assert_eq!(completed.load(Ordering::SeqCst), FIBERS);
}
