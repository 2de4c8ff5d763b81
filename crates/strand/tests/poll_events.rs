//! Intercepted poll: pure timeout, wakeup before timeout, and the
//! syscall-free fast path on an already-writable socket.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Instant;

static TIMEOUT_RET: AtomicI32 = AtomicI32::new(-99);
static TIMEOUT_ELAPSED_MS: AtomicU64 = AtomicU64::new(0);

static WAKE_RET: AtomicI32 = AtomicI32::new(-99);
static WAKE_REVENTS: AtomicI32 = AtomicI32::new(0);
static WAKE_ELAPSED_MS: AtomicU64 = AtomicU64::new(0);

static FAST_RET: AtomicI32 = AtomicI32::new(-99);
static FAST_POLLOUT: AtomicBool = AtomicBool::new(false);

fn fiber_sleep_ms(ms: i32) {
    unsafe { libc::poll(std::ptr::null_mut(), 0, ms) };
}

#[test]
fn poll_timeout_wakeup_and_fast_path() {
    // Pure 50 ms timeout with no descriptors.
    strand::spawn(|| {
        let start = Instant::now();
        let ret = unsafe { libc::poll(std::ptr::null_mut(), 0, 50) };
        TIMEOUT_RET.store(ret, Ordering::SeqCst);
        TIMEOUT_ELAPSED_MS.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
    });

    // Readable-pipe wakeup well before a 1 s timeout.
    let mut pipe_fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
    let (pipe_r, pipe_w) = (pipe_fds[0], pipe_fds[1]);

    strand::spawn(move || {
        let mut pfd = libc::pollfd {
            fd: pipe_r,
            events: libc::POLLIN,
            revents: 0,
        };
        let start = Instant::now();
        let ret = unsafe { libc::poll(&mut pfd, 1, 1000) };
        WAKE_RET.store(ret, Ordering::SeqCst);
        WAKE_REVENTS.store(pfd.revents as i32, Ordering::SeqCst);
        WAKE_ELAPSED_MS.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);

        let mut byte = 0u8;
        unsafe { libc::read(pipe_r, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        unsafe { libc::close(pipe_r) };
    });

    strand::spawn(move || {
        fiber_sleep_ms(10);
        let byte = 1u8;
        let n = unsafe { libc::write(pipe_w, &byte as *const u8 as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        unsafe { libc::close(pipe_w) };
    });

    // Fast path: a socketpair end is writable from the first intercepted
    // write onward, so POLLOUT resolves from table state alone.
    let mut sp = [0i32; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sp.as_mut_ptr()) },
        0
    );
    let (sp_a, sp_b) = (sp[0], sp[1]);

    strand::spawn(move || {
        let probe = 0u8;
        unsafe { libc::write(sp_a, &probe as *const u8 as *const libc::c_void, 1) };

        let mut pfd = libc::pollfd {
            fd: sp_a,
            events: libc::POLLOUT,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 1000) };
        FAST_RET.store(ret, Ordering::SeqCst);
        FAST_POLLOUT.store(pfd.revents & libc::POLLOUT != 0, Ordering::SeqCst);

        unsafe {
            libc::close(sp_a);
            libc::close(sp_b);
        }
    });

    strand::start_loop().expect("start_loop failed");
    strand::stop_loop().expect("stop_loop failed");

    // Timeout scenario: returned 0 in a plausible window.
    assert_eq!(TIMEOUT_RET.load(Ordering::SeqCst), 0);
    let elapsed = TIMEOUT_ELAPSED_MS.load(Ordering::SeqCst);
    assert!((45..1500).contains(&elapsed), "timeout elapsed {} ms", elapsed);

    // Wakeup scenario: one ready fd, POLLIN set, long before the timeout.
    assert_eq!(WAKE_RET.load(Ordering::SeqCst), 1);
    assert_ne!(WAKE_REVENTS.load(Ordering::SeqCst) & libc::POLLIN as i32, 0);
    assert!(WAKE_ELAPSED_MS.load(Ordering::SeqCst) < 900);

    // Fast path: already-writable resolves to POLLOUT.
    assert_eq!(FAST_RET.load(Ordering::SeqCst), 1);
    assert!(FAST_POLLOUT.load(Ordering::SeqCst));
}
