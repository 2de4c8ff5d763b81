//! Socket surface under interception: a fiber connects to a
//! slow-accepting peer (the non-blocking connect reports in-progress and
//! the fiber parks until the handshake completes), then pushes a payload
//! through sendto/recvfrom against an accept4-ing echo fiber.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

const TOTAL: usize = 32 * 1024;

static CONNECT_RET: AtomicI32 = AtomicI32::new(-99);
static ACCEPTED_FD: AtomicI32 = AtomicI32::new(-1);
static ECHOED: AtomicUsize = AtomicUsize::new(0);
static MISMATCHES: AtomicUsize = AtomicUsize::new(0);

fn fiber_sleep_ms(ms: i32) {
    unsafe { libc::poll(std::ptr::null_mut(), 0, ms) };
}

fn listen_ephemeral() -> (i32, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        assert_eq!(
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            0
        );
        assert_eq!(libc::listen(fd, 4), 0);

        let mut bound: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        assert_eq!(
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len),
            0
        );
        (fd, u16::from_be(bound.sin_port))
    }
}

fn pattern(i: usize) -> u8 {
    (i * 37 % 239) as u8
}

/// sendto with no destination, looping over partial transfers.
fn sendto_all(fd: i32, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                std::ptr::null(),
                0,
            )
        };
        assert!(n > 0, "sendto failed: {}", std::io::Error::last_os_error());
        buf = &buf[n as usize..];
    }
}

fn server(listener: i32) {
    // Slow acceptor: the client's connect is already in flight and
    // parked by the time anyone picks it up.
    fiber_sleep_ms(50);

    let conn = unsafe {
        libc::accept4(
            listener,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    };
    ACCEPTED_FD.store(conn, Ordering::SeqCst);
    assert!(conn >= 0, "accept4 failed: {}", std::io::Error::last_os_error());

    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::recv(conn, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            break;
        }
        sendto_all(conn, &buf[..n as usize]);
        ECHOED.fetch_add(n as usize, Ordering::SeqCst);
    }

    unsafe {
        libc::close(conn);
        libc::close(listener);
    }
}

fn client(port: u16) {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(fd >= 0);

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    CONNECT_RET.store(ret, Ordering::SeqCst);
    assert_eq!(ret, 0, "connect failed: {}", std::io::Error::last_os_error());

    let data: Vec<u8> = (0..TOTAL).map(pattern).collect();
    sendto_all(fd, &data);

    // Read the echo back through recvfrom with no source address.
    let mut buf = [0u8; 4096];
    let mut off = 0usize;
    while off < TOTAL {
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        assert!(n > 0, "recvfrom failed: {}", std::io::Error::last_os_error());
        for i in 0..n as usize {
            if buf[i] != pattern(off + i) {
                MISMATCHES.fetch_add(1, Ordering::SeqCst);
            }
        }
        off += n as usize;
    }

    unsafe { libc::close(fd) };
}

#[test]
fn fiber_connect_and_echo_over_sockets() {
    let (listener, port) = listen_ephemeral();

    strand::spawn(move || server(listener));
    strand::spawn(move || client(port));

    strand::start_loop().expect("start_loop failed");
    strand::stop_loop().expect("stop_loop failed");

    // The in-progress connect resolved to plain success for the caller.
    assert_eq!(CONNECT_RET.load(Ordering::SeqCst), 0);
    assert!(ACCEPTED_FD.load(Ordering::SeqCst) >= 0);
    // Every payload byte crossed the socket twice, unchanged.
    assert_eq!(ECHOED.load(Ordering::SeqCst), TOTAL);
    assert_eq!(MISMATCHES.load(Ordering::SeqCst), 0);
}
