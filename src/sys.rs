//! Raw, non-blocking syscall wrappers: socket creation, `epoll`, vectored
//! I/O, and `sendfile`.
//!
//! Grounded in the teacher's `syscalls.rs` (socket/epoll setup, `read`/
//! `write`/`writev` wrappers) — trimmed to Linux/epoll only, since spec.md's
//! "kernel file-to-socket transfer" and edge-triggered poller are both
//! Linux-specific (`sendfile(2)`, `epoll`), and the teacher's own macOS
//! `kqueue` fallback has no sendfile equivalent to pair it with here.

use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;

/// Creates a non-blocking, `SO_REUSEADDR`/`SO_REUSEPORT` IPv4 listening
/// socket bound to `port` on all interfaces, with `SOMAXCONN` backlog.
///
/// Every worker calls this independently for the same port; the kernel
/// load-balances accepted connections across the resulting sockets.
pub fn create_listen_socket(port: u16) -> io::Result<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        for (level, name) in [
            (libc::SOL_SOCKET, libc::SO_REUSEADDR),
            (libc::SOL_SOCKET, libc::SO_REUSEPORT),
        ] {
            if libc::setsockopt(
                fd,
                level,
                name,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accepts one pending connection in a single `accept4` call, setting
/// `SOCK_NONBLOCK` atomically. Returns `Ok(None)` on would-block (the
/// accept queue is drained), distinct from a hard error.
pub fn accept(listen_fd: c_int) -> io::Result<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(listen_fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK);
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(fd))
    }
}

/// Enables `TCP_NODELAY` on an accepted socket.
pub fn set_nodelay(fd: c_int) -> io::Result<()> {
    let one: c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads into `buf`. `Ok(0)` means peer EOF; would-block is reported as
/// `Ok(None)`-shaped via the `Option` wrapper so callers can distinguish it
/// from a genuine zero-length read.
pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}

/// Vectored write of up to two buffers in a single `writev(2)` call.
pub fn writev2(fd: c_int, first: &[u8], second: &[u8]) -> io::Result<Option<usize>> {
    let mut iov = [
        libc::iovec { iov_base: first.as_ptr() as *mut c_void, iov_len: first.len() },
        libc::iovec { iov_base: second.as_ptr() as *mut c_void, iov_len: second.len() },
    ];
    let count = if second.is_empty() { 1 } else { 2 };
    let n = unsafe { libc::writev(fd, iov.as_mut_ptr(), count) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}

/// Transfers up to `count` bytes from `in_fd` to socket `out_fd`, advancing
/// `offset` in place, without copying through user space.
pub fn sendfile(out_fd: c_int, in_fd: c_int, offset: &mut i64, count: usize) -> io::Result<Option<usize>> {
    let n = unsafe { libc::sendfile(out_fd, in_fd, offset as *mut i64, count) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Thin, owning wrapper around an `epoll` instance, edge-triggered on every
/// registration. `token` is an opaque `u64` user-data value — workers use
/// it as an index into their connection pool, or a sentinel for the
/// listening socket.
pub struct Epoll {
    fd: c_int,
}

const LISTEN_TOKEN: u64 = u64::MAX;

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn listen_token() -> u64 {
        LISTEN_TOKEN
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interest | libc::EPOLLET as u32, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add_read(&self, fd: c_int, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, libc::EPOLLIN as u32)
    }

    pub fn add_read_write(&self, fd: c_int, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, (libc::EPOLLIN | libc::EPOLLOUT) as u32)
    }

    pub fn modify_read_write(&self, fd: c_int, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, (libc::EPOLLIN | libc::EPOLLOUT) as u32)
    }

    pub fn modify_read_only(&self, fd: c_int, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, libc::EPOLLIN as u32)
    }

    pub fn delete(&self, fd: c_int) {
        unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Blocks up to `timeout_ms`, writing ready events into `events` and
    /// returning the count. `EINTR` is folded into `Ok(0)`, matching the
    /// teacher's and the original source's treatment of interrupted waits
    /// as "no events this tick" rather than an error.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe { libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn open_readonly(path: &std::ffi::CStr) -> io::Result<c_int> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_token_is_reserved_sentinel() {
        assert_eq!(Epoll::listen_token(), u64::MAX);
    }

    #[test]
    fn create_and_accept_roundtrip() {
        let listen_fd = create_listen_socket(0).expect("bind ephemeral port");
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(listen_fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        assert_eq!(rc, 0);
        let port = u16::from_be(addr.sin_port);

        let client = std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect");

        // give the kernel a moment to enqueue the accept
        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = accept(listen_fd).expect("accept should not error");
        assert!(accepted.is_some());
        if let Some(fd) = accepted {
            close(fd);
        }
        drop(client);
        close(listen_fd);
    }
}
