//! Byte round-trip over a socketpair under backpressure.
//!
//! A writer fiber pushes 1 MiB while the peer drains 4 KiB at a time
//! with delays in between, forcing the kernel buffer full so the writer
//! parks repeatedly. Every byte must arrive intact and in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TOTAL: usize = 1024 * 1024;
const CHUNK: usize = 4096;

fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn fiber_sleep_ms(ms: i32) {
    unsafe { libc::poll(std::ptr::null_mut(), 0, ms) };
}

fn pattern(i: usize) -> u8 {
    (i * 31 % 251) as u8
}

#[test]
fn one_mebibyte_roundtrip_with_slow_reader() {
    let (a, b) = socketpair();

    let written = Arc::new(AtomicUsize::new(0));
    let read_back = Arc::new(AtomicUsize::new(0));
    let corrupt = Arc::new(AtomicUsize::new(0));

    let w = written.clone();
    strand::spawn(move || {
        let data: Vec<u8> = (0..TOTAL).map(pattern).collect();
        let mut off = 0usize;
        while off < TOTAL {
            let n = unsafe {
                libc::write(
                    a,
                    data[off..].as_ptr() as *const libc::c_void,
                    TOTAL - off,
                )
            };
            assert!(n > 0, "write failed: {}", std::io::Error::last_os_error());
            off += n as usize;
        }
        w.store(off, Ordering::SeqCst);
        unsafe { libc::close(a) };
    });

    let r = read_back.clone();
    let bad = corrupt.clone();
    strand::spawn(move || {
        let mut buf = [0u8; CHUNK];
        let mut off = 0usize;
        loop {
            let n = unsafe {
                libc::read(b, buf.as_mut_ptr() as *mut libc::c_void, CHUNK)
            };
            if n == 0 {
                break;
            }
            assert!(n > 0, "read failed: {}", std::io::Error::last_os_error());
            for i in 0..n as usize {
                if buf[i] != pattern(off + i) {
                    bad.fetch_add(1, Ordering::SeqCst);
                }
            }
            off += n as usize;
            // Slow drain: keeps the kernel buffer full so the writer
            // exercises its parked state.
            fiber_sleep_ms(2);
        }
        r.store(off, Ordering::SeqCst);
        unsafe { libc::close(b) };
    });

    strand::start_loop().expect("start_loop failed");
    strand::stop_loop().expect("stop_loop failed");

    assert_eq!(written.load(Ordering::SeqCst), TOTAL);
    assert_eq!(read_back.load(Ordering::SeqCst), TOTAL);
    assert_eq!(corrupt.load(Ordering::SeqCst), 0);
}
