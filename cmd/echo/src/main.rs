//! TCP echo server on the intercepted POSIX surface
//!
//! One acceptor fiber per worker plus one fiber per connection, all
//! issuing plain blocking-shaped accept/read/write. The runtime turns
//! every call cooperative; no thread ever blocks on a socket.
//!
//! ```text
//! cargo run -p strand-echo [port]
//! printf hello | nc 127.0.0.1 9000
//! ```
//!
//! SIGTERM exits immediately (runtime policy).

use std::sync::atomic::{AtomicUsize, Ordering};

static CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

fn listen_on(port: u16) -> i32 {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket failed: {}", std::io::Error::last_os_error());

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        let ret = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(ret, 0, "bind failed: {}", std::io::Error::last_os_error());

        let ret = libc::listen(fd, 1024);
        assert_eq!(ret, 0, "listen failed: {}", std::io::Error::last_os_error());
        fd
    }
}

/// Echo until the peer shuts down.
fn serve(conn: i32) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = unsafe { libc::read(conn, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let w = unsafe {
                libc::write(
                    conn,
                    buf[off..].as_ptr() as *const libc::c_void,
                    n as usize - off,
                )
            };
            if w <= 0 {
                unsafe { libc::close(conn) };
                return;
            }
            off += w as usize;
        }
    }
    unsafe { libc::close(conn) };
}

fn acceptor(listener: i32, id: usize) {
    loop {
        let conn = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            strand::fwarn!(
                "acceptor {}: accept failed: errno {}",
                id,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            break;
        }
        let total = CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        strand::fdebug!("acceptor {}: connection {} (fd {})", id, total, conn);
        strand::spawn(move || serve(conn));
    }
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(9000);

    let listener = listen_on(port);
    println!("echo listening on 0.0.0.0:{}", port);

    // A few acceptors exercise the accept fan-out path; the listener's
    // readiness machine serializes them.
    for id in 0..4 {
        strand::spawn(move || acceptor(listener, id));
    }

    strand::start_loop().expect("runtime startup failed");
    strand::stop_loop().expect("runtime shutdown failed");
}
