use std::io::{self, ErrorKind};
use std::mem;
use std::net::Shutdown;
use std::ops;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

/// Socket-option flags applied at creation time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SocketOptions(u8);

const NON_BLOCKED: u8 = 0b0001;
const LINGER: u8 = 0b0010;
const REUSE_ADDR: u8 = 0b0100;
const TCP_NODELAY: u8 = 0b1000;

impl SocketOptions {
    pub fn empty() -> SocketOptions {
        SocketOptions(0)
    }

    pub fn non_blocked() -> SocketOptions {
        SocketOptions(NON_BLOCKED)
    }

    pub fn linger() -> SocketOptions {
        SocketOptions(LINGER)
    }

    pub fn reuse_addr() -> SocketOptions {
        SocketOptions(REUSE_ADDR)
    }

    pub fn tcp_nodelay() -> SocketOptions {
        SocketOptions(TCP_NODELAY)
    }

    pub fn is_non_blocked(&self) -> bool {
        self.0 & NON_BLOCKED != 0
    }

    pub fn is_linger(&self) -> bool {
        self.0 & LINGER != 0
    }

    pub fn is_reuse_addr(&self) -> bool {
        self.0 & REUSE_ADDR != 0
    }

    pub fn is_tcp_nodelay(&self) -> bool {
        self.0 & TCP_NODELAY != 0
    }
}

impl ops::BitOr for SocketOptions {
    type Output = SocketOptions;

    fn bitor(self, other: SocketOptions) -> SocketOptions {
        SocketOptions(self.0 | other.0)
    }
}

fn setsockopt<T>(fd: RawFd, level: c_int, opt: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(fd: RawFd, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    debug_assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

/// Creates a socket. `SOCK_CLOEXEC` is unconditional; `SOCK_NONBLOCK` and the
/// remaining options follow the flags.
pub fn open(family: c_int, ty: c_int, opts: SocketOptions) -> io::Result<RawFd> {
    let mut ty = ty | libc::SOCK_CLOEXEC;
    if opts.is_non_blocked() {
        ty |= libc::SOCK_NONBLOCK;
    }

    let fd = syscall!(socket(family, ty, 0))?;

    if let Err(e) = apply_options(fd, family, opts) {
        let _ = close(fd);
        return Err(e);
    }

    Ok(fd)
}

fn apply_options(fd: RawFd, family: c_int, opts: SocketOptions) -> io::Result<()> {
    if opts.is_reuse_addr() {
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)?;
    }

    if opts.is_linger() {
        let lg = libc::linger {
            l_onoff: 1,
            l_linger: 30,
        };
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, lg)?;
    }

    if opts.is_tcp_nodelay() && (family == libc::AF_INET || family == libc::AF_INET6) {
        set_nodelay(fd, true)?;
    }

    Ok(())
}

pub fn set_nodelay(fd: RawFd, nodelay: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
}

pub fn bind(fd: RawFd, addr: &libc::sockaddr_storage, len: socklen_t) -> io::Result<()> {
    syscall!(bind(fd, addr as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// A connected pair of non-blocking Unix stream sockets.
pub fn pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0, 0];
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
        fds.as_mut_ptr()
    ))?;
    Ok((fds[0], fds[1]))
}

/// Begins a connect. `Ok(true)` means the socket is connected, `Ok(false)`
/// that the connect is in progress on a non-blocking socket.
pub fn connect(fd: RawFd, addr: &libc::sockaddr_storage, len: socklen_t) -> io::Result<bool> {
    match syscall!(connect(fd, addr as *const _ as *const libc::sockaddr, len)) {
        Ok(_) => Ok(true),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Accepts one pending connection. `Ok(None)` when the backlog is drained.
/// `EINTR` is retried in place. The accepted fd is non-blocking and
/// close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, libc::sockaddr_storage, socklen_t)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let res = loop {
        match syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        )) {
            Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
            other => break other,
        }
    };

    match res {
        Ok(cfd) => Ok(Some((cfd, storage, len))),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0))?;
    Ok(n as usize)
}

pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const c_void,
        buf.len(),
        libc::MSG_NOSIGNAL
    ))?;
    Ok(n as usize)
}

pub fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    syscall!(shutdown(fd, how))?;
    Ok(())
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd))?;
    Ok(())
}

/// Reads and clears `SO_ERROR`.
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn local_addr(fd: RawFd) -> io::Result<(libc::sockaddr_storage, socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;
    Ok((storage, len))
}
