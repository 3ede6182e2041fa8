use std::collections::VecDeque;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::RawFd;

use log::trace;

use crate::addr::Address;
use crate::buffer::{ConstBuffer, MutableBuffer};
use crate::clock::Deadline;
use crate::sys::socket::{self, SocketOptions};
use crate::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
}

const SHUT_READ: u8 = 0b01;
const SHUT_WRITE: u8 = 0b10;

fn shut_bits(how: Shutdown) -> u8 {
    match how {
        Shutdown::Read => SHUT_READ,
        Shutdown::Write => SHUT_WRITE,
        Shutdown::Both => SHUT_READ | SHUT_WRITE,
    }
}

/// A queued receive operation. `exact` demands the buffer be filled to
/// capacity before completing; otherwise any progress completes it.
pub(crate) struct RecvOp {
    pub buf: MutableBuffer,
    pub deadline: Deadline,
    pub exact: bool,
}

/// A queued send operation, `exact` meaning fully drained.
pub(crate) struct SendOp {
    pub buf: ConstBuffer,
    pub deadline: Deadline,
    pub exact: bool,
}

/// Result of one immediate non-blocking attempt on the head operation.
pub(crate) enum IoOutcome {
    /// The queue is empty.
    Idle,
    /// The head is unsatisfied; arm the matching readiness.
    Pending,
    /// The head is satisfied; pop it and deliver `ok`.
    Done,
    /// The head failed; pop it and deliver `error`. Buffers behind it stay
    /// queued until a shutdown or close cancels them.
    Failed(io::Error),
}

/// A connected (or connecting) stream socket with per-direction FIFO queues
/// of pending buffers.
///
/// State machine: `Closed -> Opening -> Open -> Closed`; an accepted fd
/// starts at `Open`, a connect that returns in-progress at `Opening`. The
/// server drives the queues from selector events; the channel itself only
/// moves bytes and cursors.
pub struct Channel {
    fd: RawFd,
    state: ChannelState,
    shut: u8,
    eof: bool,
    rdops: VecDeque<RecvOp>,
    wrops: VecDeque<SendOp>,
}

impl Channel {
    /// Wraps an fd obtained from `accept`.
    pub(crate) fn from_accepted(fd: RawFd) -> Channel {
        Channel {
            fd,
            state: ChannelState::Open,
            shut: 0,
            eof: false,
            rdops: VecDeque::new(),
            wrops: VecDeque::new(),
        }
    }

    /// Creates a non-blocking socket with the requested options and starts
    /// a connect to `remote`.
    ///
    /// Returns the channel and whether the connect completed synchronously;
    /// `false` leaves the channel in `Opening`, to be finished by the first
    /// writable or error event.
    pub(crate) fn connect(remote: &Address, opts: SocketOptions) -> Result<(Channel, bool)> {
        let (storage, len) = remote.to_sockaddr()?;
        let fd = socket::open(
            remote.family_raw(),
            remote.type_raw(),
            opts | SocketOptions::non_blocked(),
        )?;

        match socket::connect(fd, &storage, len) {
            Ok(connected) => {
                trace!(
                    "channel connect, fd: {}, remote: {}, in progress: {}",
                    fd,
                    remote,
                    !connected
                );
                let state = if connected {
                    ChannelState::Open
                } else {
                    ChannelState::Opening
                };
                Ok((
                    Channel {
                        fd,
                        state,
                        shut: 0,
                        eof: false,
                        rdops: VecDeque::new(),
                        wrops: VecDeque::new(),
                    },
                    connected,
                ))
            }
            Err(e) => {
                let _ = socket::close(fd);
                Err(Error::Io(e))
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub(crate) fn set_open(&mut self) {
        self.state = ChannelState::Open;
    }

    pub(crate) fn is_shut_read(&self) -> bool {
        self.shut & SHUT_READ != 0
    }

    pub(crate) fn is_shut_write(&self) -> bool {
        self.shut & SHUT_WRITE != 0
    }

    /// Calls `shutdown(2)` and records the direction. Shutting a direction
    /// twice is a contract violation.
    pub(crate) fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        let bits = shut_bits(how);
        if self.shut & bits == bits {
            return Err(Error::Closed(self.fd));
        }

        socket::shutdown(self.fd, how)?;
        self.shut |= bits;

        trace!("channel shutdown, fd: {}, how: {:?}", self.fd, how);

        Ok(())
    }

    /// Enqueues a receive. True when the new operation is alone at the head
    /// and readiness should be armed.
    pub(crate) fn push_recv(&mut self, op: RecvOp) -> bool {
        self.rdops.push_back(op);
        self.rdops.len() == 1
    }

    pub(crate) fn push_send(&mut self, op: SendOp) -> bool {
        self.wrops.push_back(op);
        self.wrops.len() == 1
    }

    pub(crate) fn pop_recv(&mut self) -> Option<RecvOp> {
        self.rdops.pop_front()
    }

    pub(crate) fn pop_send(&mut self) -> Option<SendOp> {
        self.wrops.pop_front()
    }

    pub(crate) fn has_recv_pending(&self) -> bool {
        !self.rdops.is_empty()
    }

    pub(crate) fn has_send_pending(&self) -> bool {
        !self.wrops.is_empty()
    }

    pub(crate) fn head_recv_deadline(&self) -> Deadline {
        self.rdops.front().map_or(Deadline::NEVER, |op| op.deadline)
    }

    pub(crate) fn head_send_deadline(&self) -> Deadline {
        self.wrops.front().map_or(Deadline::NEVER, |op| op.deadline)
    }

    pub(crate) fn take_recv_ops(&mut self) -> VecDeque<RecvOp> {
        std::mem::take(&mut self.rdops)
    }

    pub(crate) fn take_send_ops(&mut self) -> VecDeque<SendOp> {
        std::mem::take(&mut self.wrops)
    }

    /// One immediate receive attempt on the head buffer: reads while
    /// progress is positive and the buffer has room, then yields.
    pub(crate) fn try_recv_head(&mut self) -> IoOutcome {
        let fd = self.fd;
        let eof = &mut self.eof;

        let op = match self.rdops.front_mut() {
            None => return IoOutcome::Idle,
            Some(op) => op,
        };

        if op.buf.remaining() == 0 {
            return IoOutcome::Done;
        }

        if *eof {
            return IoOutcome::Failed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of stream",
            ));
        }

        loop {
            match socket::recv(fd, op.buf.spare()) {
                Ok(0) => {
                    // orderly peer close
                    *eof = true;
                    trace!("channel eof, fd: {}", fd);
                    return if op.buf.filled().is_empty() {
                        IoOutcome::Failed(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed",
                        ))
                    } else {
                        IoOutcome::Done
                    };
                }
                Ok(n) => {
                    trace!("channel recv, fd: {}, bytes: {}", fd, n);
                    op.buf.advance(n);
                    if op.buf.is_full() {
                        return IoOutcome::Done;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if !op.exact && !op.buf.filled().is_empty() {
                        IoOutcome::Done
                    } else {
                        IoOutcome::Pending
                    };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return IoOutcome::Failed(e),
            }
        }
    }

    /// One immediate send attempt on the head buffer, symmetric to
    /// `try_recv_head`.
    pub(crate) fn try_send_head(&mut self) -> IoOutcome {
        let fd = self.fd;

        let op = match self.wrops.front_mut() {
            None => return IoOutcome::Idle,
            Some(op) => op,
        };

        if op.buf.remaining() == 0 {
            return IoOutcome::Done;
        }

        loop {
            match socket::send(fd, op.buf.pending()) {
                Ok(n) => {
                    trace!("channel send, fd: {}, bytes: {}", fd, n);
                    op.buf.advance(n);
                    if op.buf.is_drained() {
                        return IoOutcome::Done;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if !op.exact && op.buf.position() > 0 {
                        IoOutcome::Done
                    } else {
                        IoOutcome::Pending
                    };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return IoOutcome::Failed(e),
            }
        }
    }

    /// Closes the fd and marks both directions shut. Idempotent.
    pub(crate) fn close_fd(&mut self) {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Closed;
            self.shut = SHUT_READ | SHUT_WRITE;
            let _ = socket::close(self.fd);
            trace!("channel closed, fd: {}", self.fd);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close_fd();
    }
}
