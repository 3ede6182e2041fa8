use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, ptr};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI};

use crate::event::{EventSet, Ops};

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    /// Waits for readiness. `timeout` of `None` blocks indefinitely. `EINTR`
    /// is reported as an empty batch so the caller simply re-enters.
    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        events.clear();

        let cnt = match syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout
        )) {
            Ok(cnt) => cnt as usize,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { events.set_len(cnt) };

        Ok(cnt)
    }

    /// Registers `fd` with the given interest. The fd itself is the event
    /// token.
    pub fn add(&self, fd: RawFd, interest: Ops) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Ops) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epfd,
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))?;

        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn interest_to_epoll(interest: Ops) -> u32 {
    let mut kind = 0;

    if interest.is_read() {
        kind |= EPOLLIN;
    }

    if interest.is_write() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

/// Translates a raw epoll event mask into the crate's event set. `EPOLLHUP`
/// folds into the error bit: the kernel reports it even under an empty
/// interest mask, so leaving it unmapped would re-fire forever.
pub fn epoll_to_set(events: u32) -> EventSet {
    let epoll = events as libc::c_int;
    let mut set = EventSet::empty();

    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        set = set | EventSet::read();
    }

    if (epoll & EPOLLOUT) != 0 {
        set = set | EventSet::write();
    }

    if (epoll & EPOLLERR) != 0 || (epoll & EPOLLHUP) != 0 {
        set = set | EventSet::error();
    }

    set
}
