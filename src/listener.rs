use std::io;
use std::os::unix::io::RawFd;

use log::trace;

use crate::addr::{Address, Family, Transport};
use crate::sys::socket::{self, SocketOptions};
use crate::Result;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Closed,
    Open,
}

/// A bound, listening socket that drains its backlog on every readable
/// event.
pub struct Listener {
    fd: RawFd,
    state: ListenerState,
    nodelay: bool,
}

impl Listener {
    /// Binds and listens on `local` with `SO_REUSEADDR`.
    pub(crate) fn open(local: &Address) -> Result<Listener> {
        let (storage, len) = local.to_sockaddr()?;
        let fd = socket::open(
            local.family_raw(),
            local.type_raw(),
            SocketOptions::non_blocked() | SocketOptions::reuse_addr(),
        )?;

        let r = socket::bind(fd, &storage, len).and_then(|_| socket::listen(fd, libc::SOMAXCONN));
        if let Err(e) = r {
            let _ = socket::close(fd);
            return Err(e.into());
        }

        trace!("listener open, fd: {}, local: {}", fd, local);

        Ok(Listener {
            fd,
            state: ListenerState::Open,
            nodelay: local.family() != Family::Unix,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ListenerState::Open
    }

    /// Accepts one pending connection; `Ok(None)` when the backlog is
    /// drained. The accepted fd comes back non-blocking, close-on-exec and,
    /// for inet families, with `TCP_NODELAY`.
    pub(crate) fn accept(&self) -> io::Result<Option<(RawFd, Option<Address>)>> {
        match socket::accept(self.fd)? {
            None => Ok(None),
            Some((cfd, storage, len)) => {
                if self.nodelay {
                    let _ = socket::set_nodelay(cfd, true);
                }

                let remote = Address::from_sockaddr(&storage, len, Transport::Stream);
                Ok(Some((cfd, remote)))
            }
        }
    }

    pub(crate) fn close_fd(&mut self) {
        if self.state != ListenerState::Closed {
            self.state = ListenerState::Closed;
            let _ = socket::close(self.fd);
            trace!("listener closed, fd: {}", self.fd);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close_fd();
    }
}
