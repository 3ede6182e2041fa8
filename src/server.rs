use std::collections::VecDeque;
use std::net::Shutdown;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use log::{trace, warn};

use crate::addr::{Address, Transport};
use crate::buffer::{ConstBuffer, MutableBuffer};
use crate::channel::{Channel, ChannelState, IoOutcome, RecvOp, SendOp};
use crate::clock::Deadline;
use crate::event::{EventSet, Events, Ops};
use crate::listener::{Listener, ListenerState};
use crate::selector::{Selector, SelectorOptions};
use crate::sys::socket::{self, SocketOptions};
use crate::waker::Waker;
use crate::{Error, Result};

/// Completion status delivered to receive, send and connect callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Cancelled,
}

impl Status {
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Error => -1,
            Status::Cancelled => -2,
        }
    }
}

pub type AcceptCallback = Box<dyn FnMut(&mut Control<'_>, RawFd, RawFd, Option<&Address>)>;
pub type RecvCallback = Box<dyn FnMut(&mut Control<'_>, RawFd, Status, &mut MutableBuffer)>;
pub type SendCallback = Box<dyn FnMut(&mut Control<'_>, RawFd, Status, &mut ConstBuffer)>;
pub type ConnectCallback = Box<dyn FnMut(&mut Control<'_>, RawFd, Status)>;
pub type CloseCallback = Box<dyn FnMut(&mut Control<'_>, RawFd)>;
pub type IdleCallback = Box<dyn FnMut(&mut Control<'_>, Status)>;

/// A request deferred to the loop thread. Callbacks record what they want
/// through [`Control`]; the loop applies the queue before the next wait.
enum Command {
    Send {
        fd: RawFd,
        buf: ConstBuffer,
        deadline: Deadline,
        exact: bool,
    },
    Receive {
        fd: RawFd,
        buf: MutableBuffer,
        deadline: Deadline,
        exact: bool,
    },
    Shutdown {
        fd: RawFd,
        how: Shutdown,
    },
    CancelQueue {
        fd: RawFd,
        how: Shutdown,
    },
    Close {
        fd: RawFd,
    },
    CloseListener {
        fd: RawFd,
    },
    AcceptChannel {
        fd: RawFd,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    },
    Open {
        remote: Address,
        opts: SocketOptions,
        deadline: Deadline,
        connect_cb: ConnectCallback,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    },
    Exit,
}

/// The face of the server available inside callbacks.
///
/// Every method defers: it enqueues a command the loop executes after the
/// current dispatch round, keeping callbacks free of re-entrant mutation.
pub struct Control<'a> {
    commands: &'a mut VecDeque<Command>,
}

impl<'a> Control<'a> {
    /// Queues `buf` for sending; completes only when fully drained.
    pub fn send(&mut self, fd: RawFd, buf: ConstBuffer, deadline: Deadline) {
        self.commands.push_back(Command::Send {
            fd,
            buf,
            deadline,
            exact: true,
        });
    }

    /// Queues `buf` for sending; completes once any bytes go out.
    pub fn send_some(&mut self, fd: RawFd, buf: ConstBuffer, deadline: Deadline) {
        self.commands.push_back(Command::Send {
            fd,
            buf,
            deadline,
            exact: false,
        });
    }

    /// Queues `buf` for receiving; completes when filled to capacity.
    pub fn begin_receive(&mut self, fd: RawFd, buf: MutableBuffer, deadline: Deadline) {
        self.commands.push_back(Command::Receive {
            fd,
            buf,
            deadline,
            exact: true,
        });
    }

    /// Queues `buf` for receiving; completes once any bytes arrive.
    pub fn begin_receive_some(&mut self, fd: RawFd, buf: MutableBuffer, deadline: Deadline) {
        self.commands.push_back(Command::Receive {
            fd,
            buf,
            deadline,
            exact: false,
        });
    }

    pub fn shutdown_channel(&mut self, fd: RawFd, how: Shutdown) {
        self.commands.push_back(Command::Shutdown { fd, how });
    }

    pub fn close_channel(&mut self, fd: RawFd) {
        self.commands.push_back(Command::Close { fd });
    }

    pub fn close_listener(&mut self, fd: RawFd) {
        self.commands.push_back(Command::CloseListener { fd });
    }

    /// Wraps an accepted fd in a channel with the given callbacks.
    pub fn accept_channel(
        &mut self,
        fd: RawFd,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) {
        self.commands.push_back(Command::AcceptChannel {
            fd,
            recv_cb,
            send_cb,
            close_cb,
        });
    }

    /// Opens an outbound channel; `opts` selects extra socket options such
    /// as linger or nodelay. The connect callback receives the new fd, or
    /// `-1` with `Status::Error` when socket creation fails.
    pub fn open_channel(
        &mut self,
        remote: Address,
        opts: SocketOptions,
        deadline: Deadline,
        connect_cb: ConnectCallback,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) {
        self.commands.push_back(Command::Open {
            remote,
            opts,
            deadline,
            connect_cb,
            recv_cb,
            send_cb,
            close_cb,
        });
    }

    pub fn exit_loop(&mut self) {
        self.commands.push_back(Command::Exit);
    }
}

struct ListenerEntry {
    listener: Listener,
    accept_cb: AcceptCallback,
}

struct ChannelEntry {
    channel: Channel,
    connect_cb: Option<ConnectCallback>,
    recv_cb: RecvCallback,
    send_cb: SendCallback,
    close_cb: CloseCallback,
}

/// A single-threaded socket server multiplexing listeners and channels over
/// one [`Selector`].
///
/// All methods must run on the loop thread; the only cross-thread entry
/// points are the [`Waker`] from `waker()` and the selector's `remote()`.
/// User callbacks run on the loop thread and must not block.
///
/// Guarantees, per fd: receive completions fire in submission order, send
/// completions fire in submission order, a read callback precedes a write
/// callback within one poll batch, and the close callback fires exactly
/// once, strictly after every pending operation has completed or been
/// cancelled.
pub struct Server {
    selector: Selector,
    listeners: IndexMap<RawFd, ListenerEntry>,
    channels: IndexMap<RawFd, ChannelEntry>,
    commands: VecDeque<Command>,
    events: Events,
    idle_interval: Option<Duration>,
    idle_cb: Option<IdleCallback>,
    exit: bool,
}

impl Server {
    pub fn new() -> Result<Server> {
        Server::with_options(SelectorOptions::empty())
    }

    pub fn with_options(options: SelectorOptions) -> Result<Server> {
        Ok(Server {
            selector: Selector::with_options(options)?,
            listeners: IndexMap::new(),
            channels: IndexMap::new(),
            commands: VecDeque::new(),
            events: Events::with_capacity(1024),
            idle_interval: None,
            idle_cb: None,
            exit: false,
        })
    }

    /// Opens a listener on `local` and starts accepting. Returns the
    /// listener fd, which doubles as its handle.
    pub fn add_listener(&mut self, local: &Address, accept_cb: AcceptCallback) -> Result<RawFd> {
        let listener = Listener::open(local)?;
        let fd = listener.fd();

        self.selector.add(fd)?;
        self.selector.request(fd, Ops::read(), Deadline::NEVER)?;

        self.listeners.insert(
            fd,
            ListenerEntry {
                listener,
                accept_cb,
            },
        );

        Ok(fd)
    }

    /// The local address a listener is bound to; useful with port 0.
    pub fn listener_addr(&self, fd: RawFd) -> Result<Address> {
        if !self.listeners.contains_key(&fd) {
            return Err(Error::UnknownFd(fd));
        }

        let (storage, len) = socket::local_addr(fd)?;
        Address::from_sockaddr(&storage, len, Transport::Stream)
            .ok_or_else(|| Error::Addr("unsupported socket family".to_string()))
    }

    pub fn close_listener(&mut self, fd: RawFd) -> Result<()> {
        if !self.listeners.contains_key(&fd) {
            return Err(Error::UnknownFd(fd));
        }

        self.exec_close_listener(fd);
        Ok(())
    }

    /// Registers an already-accepted fd as a channel with empty interest.
    pub fn accept_channel(
        &mut self,
        fd: RawFd,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) -> Result<RawFd> {
        if self.channels.contains_key(&fd) || self.listeners.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }

        self.selector.add(fd)?;
        self.channels.insert(
            fd,
            ChannelEntry {
                channel: Channel::from_accepted(fd),
                connect_cb: None,
                recv_cb,
                send_cb,
                close_cb,
            },
        );

        trace!("channel accepted, fd: {}", fd);

        Ok(fd)
    }

    /// Opens an outbound channel to `remote`; `opts` selects extra socket
    /// options such as linger or nodelay. The connect callback fires with
    /// `Status::Ok` once connected (synchronously if the connect completes
    /// at once) or `Status::Error` on failure or deadline expiry; a failed
    /// open then closes the channel, firing the close callback.
    pub fn open_channel(
        &mut self,
        remote: &Address,
        opts: SocketOptions,
        deadline: Deadline,
        connect_cb: ConnectCallback,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) -> Result<RawFd> {
        let (channel, connected) = Channel::connect(remote, opts)?;
        self.install_channel(channel, connected, deadline, connect_cb, recv_cb, send_cb, close_cb)
    }

    fn install_channel(
        &mut self,
        channel: Channel,
        connected: bool,
        deadline: Deadline,
        connect_cb: ConnectCallback,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) -> Result<RawFd> {
        let fd = channel.fd();

        self.selector.add(fd)?;
        self.channels.insert(
            fd,
            ChannelEntry {
                channel,
                connect_cb: Some(connect_cb),
                recv_cb,
                send_cb,
                close_cb,
            },
        );

        if connected {
            let Server {
                channels, commands, ..
            } = self;
            let entry = channels.get_mut(&fd).expect("just inserted");
            if let Some(cb) = entry.connect_cb.as_mut() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                cb(&mut ctl, fd, Status::Ok);
            }
        } else {
            self.selector.request(fd, Ops::write(), deadline)?;
        }

        Ok(fd)
    }

    /// Queues a receive buffer; the completion callback fires when it is
    /// full. A zero-capacity buffer completes immediately.
    pub fn begin_receive(&mut self, fd: RawFd, buf: MutableBuffer, deadline: Deadline) -> Result<()> {
        self.do_receive(fd, buf, deadline, true)
    }

    /// Queues a receive buffer; completes once any bytes arrive.
    pub fn begin_receive_some(
        &mut self,
        fd: RawFd,
        buf: MutableBuffer,
        deadline: Deadline,
    ) -> Result<()> {
        self.do_receive(fd, buf, deadline, false)
    }

    /// Queues a send buffer; the completion callback fires when it is fully
    /// drained. Buffers drain strictly in submission order: a new buffer is
    /// never sent ahead of queued ones, so no synchronous attempt is made
    /// here. A zero-length buffer completes immediately.
    pub fn send(&mut self, fd: RawFd, buf: ConstBuffer, deadline: Deadline) -> Result<()> {
        self.do_send(fd, buf, deadline, true)
    }

    /// Queues a send buffer; completes once any bytes go out.
    pub fn send_some(&mut self, fd: RawFd, buf: ConstBuffer, deadline: Deadline) -> Result<()> {
        self.do_send(fd, buf, deadline, false)
    }

    /// Shuts down one or both directions now, then cancels the queued
    /// buffers of those directions asynchronously with `Status::Cancelled`.
    pub fn shutdown_channel(&mut self, fd: RawFd, how: Shutdown) -> Result<()> {
        let entry = self.channels.get_mut(&fd).ok_or(Error::UnknownFd(fd))?;
        entry.channel.shutdown(how)?;

        self.commands.push_back(Command::CancelQueue { fd, how });
        Ok(())
    }

    /// Requests an asynchronous close: the fd leaves the selector, queued
    /// buffers cancel, the close callback fires, and the channel is gone.
    pub fn close_channel(&mut self, fd: RawFd) -> Result<()> {
        if !self.channels.contains_key(&fd) {
            return Err(Error::UnknownFd(fd));
        }

        self.commands.push_back(Command::Close { fd });
        Ok(())
    }

    pub fn channel_state(&self, fd: RawFd) -> Option<ChannelState> {
        self.channels.get(&fd).map(|e| e.channel.state())
    }

    pub fn listener_state(&self, fd: RawFd) -> Option<ListenerState> {
        self.listeners.get(&fd).map(|e| e.listener.state())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Longest wait inside one poll round; the idle callback fires whenever
    /// a round times out with no readiness.
    pub fn set_idle_interval(&mut self, interval: Option<Duration>) {
        self.idle_interval = interval;
    }

    pub fn set_idle_callback(&mut self, cb: IdleCallback) {
        self.idle_cb = Some(cb);
    }

    /// Makes `run` return after the current round.
    pub fn exit_loop(&mut self) {
        self.exit = true;
    }

    /// A cross-thread wake-up handle. Requires the thread-safe selector
    /// option.
    pub fn waker(&self) -> Result<Waker> {
        self.selector.waker()
    }

    /// Runs the loop until `exit_loop`. Fatal selector failures return the
    /// error and leave the server unusable.
    pub fn run(&mut self) -> Result<()> {
        self.exit = false;

        while !self.exit {
            self.run_once()?;
        }

        Ok(())
    }

    /// One loop turn: drain deferred commands, poll, dispatch, and fire the
    /// idle callback if the wait timed out. Returns the raw readiness count.
    pub fn run_once(&mut self) -> Result<usize> {
        self.drain_commands();

        if self.exit {
            return Ok(0);
        }

        let n = {
            let Server {
                selector,
                events,
                idle_interval,
                ..
            } = self;
            selector.poll(events, *idle_interval)?
        };

        self.dispatch()?;

        if n == 0 {
            let Server {
                idle_cb, commands, ..
            } = self;
            if let Some(cb) = idle_cb.as_mut() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                cb(&mut ctl, Status::Ok);
            }
        }

        Ok(n)
    }

    fn drain_commands(&mut self) {
        while let Some(cmd) = self.commands.pop_front() {
            match cmd {
                Command::Send {
                    fd,
                    buf,
                    deadline,
                    exact,
                } => {
                    if let Err(e) = self.do_send(fd, buf, deadline, exact) {
                        warn!("deferred send dropped, fd {}: {}", fd, e);
                    }
                }
                Command::Receive {
                    fd,
                    buf,
                    deadline,
                    exact,
                } => {
                    if let Err(e) = self.do_receive(fd, buf, deadline, exact) {
                        warn!("deferred receive dropped, fd {}: {}", fd, e);
                    }
                }
                Command::Shutdown { fd, how } => self.exec_shutdown(fd, how),
                Command::CancelQueue { fd, how } => self.exec_cancel_queue(fd, how),
                Command::Close { fd } => self.exec_close_channel(fd),
                Command::CloseListener { fd } => self.exec_close_listener(fd),
                Command::AcceptChannel {
                    fd,
                    recv_cb,
                    send_cb,
                    close_cb,
                } => {
                    if let Err(e) = self.accept_channel(fd, recv_cb, send_cb, close_cb) {
                        warn!("deferred accept dropped, fd {}: {}", fd, e);
                        let _ = socket::close(fd);
                    }
                }
                Command::Open {
                    remote,
                    opts,
                    deadline,
                    connect_cb,
                    recv_cb,
                    send_cb,
                    close_cb,
                } => self.exec_open(remote, opts, deadline, connect_cb, recv_cb, send_cb, close_cb),
                Command::Exit => self.exit = true,
            }
        }
    }

    fn exec_open(
        &mut self,
        remote: Address,
        opts: SocketOptions,
        deadline: Deadline,
        mut connect_cb: ConnectCallback,
        recv_cb: RecvCallback,
        send_cb: SendCallback,
        close_cb: CloseCallback,
    ) {
        match Channel::connect(&remote, opts) {
            Ok((channel, connected)) => {
                if let Err(e) = self.install_channel(
                    channel, connected, deadline, connect_cb, recv_cb, send_cb, close_cb,
                ) {
                    warn!("deferred open dropped, remote {}: {}", remote, e);
                }
            }
            Err(e) => {
                warn!("deferred open failed, remote {}: {}", remote, e);
                let mut ctl = Control {
                    commands: &mut self.commands,
                };
                connect_cb(&mut ctl, -1, Status::Error);
            }
        }
    }

    fn do_receive(
        &mut self,
        fd: RawFd,
        mut buf: MutableBuffer,
        deadline: Deadline,
        exact: bool,
    ) -> Result<()> {
        let Server {
            selector,
            channels,
            commands,
            ..
        } = self;

        let entry = channels.get_mut(&fd).ok_or(Error::UnknownFd(fd))?;
        if entry.channel.is_shut_read() {
            return Err(Error::Closed(fd));
        }

        if buf.remaining() == 0 {
            let mut ctl = Control {
                commands: &mut *commands,
            };
            (entry.recv_cb)(&mut ctl, fd, Status::Ok, &mut buf);
            return Ok(());
        }

        let first = entry.channel.push_recv(RecvOp {
            buf,
            deadline,
            exact,
        });

        if first && entry.channel.is_open() {
            selector.request(fd, Ops::read(), deadline)?;
        }

        Ok(())
    }

    fn do_send(
        &mut self,
        fd: RawFd,
        mut buf: ConstBuffer,
        deadline: Deadline,
        exact: bool,
    ) -> Result<()> {
        let Server {
            selector,
            channels,
            commands,
            ..
        } = self;

        let entry = channels.get_mut(&fd).ok_or(Error::UnknownFd(fd))?;
        if entry.channel.is_shut_write() {
            return Err(Error::Closed(fd));
        }

        if buf.remaining() == 0 {
            let mut ctl = Control {
                commands: &mut *commands,
            };
            (entry.send_cb)(&mut ctl, fd, Status::Ok, &mut buf);
            return Ok(());
        }

        let first = entry.channel.push_send(SendOp {
            buf,
            deadline,
            exact,
        });

        if first && entry.channel.is_open() {
            selector.request(fd, Ops::write(), deadline)?;
        }

        Ok(())
    }

    fn exec_shutdown(&mut self, fd: RawFd, how: Shutdown) {
        let Some(entry) = self.channels.get_mut(&fd) else {
            return;
        };

        if let Err(e) = entry.channel.shutdown(how) {
            warn!("deferred shutdown dropped, fd {}: {}", fd, e);
            return;
        }

        self.exec_cancel_queue(fd, how);
    }

    /// Cancels queued buffers in the shut direction(s), write queue first,
    /// each in submission order.
    fn exec_cancel_queue(&mut self, fd: RawFd, how: Shutdown) {
        let Server {
            channels, commands, ..
        } = self;

        let Some(entry) = channels.get_mut(&fd) else {
            return;
        };

        trace!("cancel queue, fd: {}, how: {:?}", fd, how);

        if matches!(how, Shutdown::Write | Shutdown::Both) {
            let ops = entry.channel.take_send_ops();
            for mut op in ops {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.send_cb)(&mut ctl, fd, Status::Cancelled, &mut op.buf);
            }
        }

        if matches!(how, Shutdown::Read | Shutdown::Both) {
            let ops = entry.channel.take_recv_ops();
            for mut op in ops {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.recv_cb)(&mut ctl, fd, Status::Cancelled, &mut op.buf);
            }
        }
    }

    fn exec_close_channel(&mut self, fd: RawFd) {
        let Some(mut entry) = self.channels.swap_remove(&fd) else {
            return;
        };

        let _ = self.selector.remove(fd);
        entry.channel.close_fd();

        let send_ops = entry.channel.take_send_ops();
        for mut op in send_ops {
            let mut ctl = Control {
                commands: &mut self.commands,
            };
            (entry.send_cb)(&mut ctl, fd, Status::Cancelled, &mut op.buf);
        }

        let recv_ops = entry.channel.take_recv_ops();
        for mut op in recv_ops {
            let mut ctl = Control {
                commands: &mut self.commands,
            };
            (entry.recv_cb)(&mut ctl, fd, Status::Cancelled, &mut op.buf);
        }

        let mut ctl = Control {
            commands: &mut self.commands,
        };
        (entry.close_cb)(&mut ctl, fd);

        trace!("channel close done, fd: {}", fd);
    }

    fn exec_close_listener(&mut self, fd: RawFd) {
        let Some(mut entry) = self.listeners.swap_remove(&fd) else {
            return;
        };

        let _ = self.selector.remove(fd);
        entry.listener.close_fd();
    }

    fn dispatch(&mut self) -> Result<()> {
        for i in 0..self.events.len() {
            let ev = self.events.get(i).expect("event index in range");
            let fd = ev.fd();

            if self.listeners.contains_key(&fd) {
                self.on_listener_event(fd, ev.events())?;
            } else if self.channels.contains_key(&fd) {
                self.on_channel_event(fd, ev.events())?;
            } else {
                trace!("event for unknown fd: {}", fd);
            }
        }

        Ok(())
    }

    fn on_listener_event(&mut self, fd: RawFd, set: EventSet) -> Result<()> {
        let Server {
            selector,
            listeners,
            commands,
            ..
        } = self;

        let Some(entry) = listeners.get_mut(&fd) else {
            return Ok(());
        };

        if set.is_read() {
            loop {
                match entry.listener.accept() {
                    Ok(Some((cfd, remote))) => {
                        trace!("accepted, listener: {}, client: {}", fd, cfd);
                        let mut ctl = Control {
                            commands: &mut *commands,
                        };
                        (entry.accept_cb)(&mut ctl, fd, cfd, remote.as_ref());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("accept failed, listener {}: {}", fd, e);
                        let mut ctl = Control {
                            commands: &mut *commands,
                        };
                        (entry.accept_cb)(&mut ctl, fd, -1, None);
                        break;
                    }
                }
            }

            // delivery consumed the read interest; keep accepting
            if entry.listener.is_open() {
                selector.request(fd, Ops::read(), Deadline::NEVER)?;
            }
        } else if set.is_error() {
            let mut ctl = Control {
                commands: &mut *commands,
            };
            (entry.accept_cb)(&mut ctl, fd, -1, None);
        }

        Ok(())
    }

    fn on_channel_event(&mut self, fd: RawFd, set: EventSet) -> Result<()> {
        if set.is_timeout() {
            self.on_channel_timeout(fd, set)
        } else if set.is_read() {
            self.on_channel_readable(fd)
        } else if set.is_error() {
            self.on_channel_error(fd)
        } else if set.is_write() {
            self.on_channel_writable(fd)
        } else {
            Ok(())
        }
    }

    fn on_channel_readable(&mut self, fd: RawFd) -> Result<()> {
        let Server {
            selector,
            channels,
            commands,
            ..
        } = self;

        let Some(entry) = channels.get_mut(&fd) else {
            return Ok(());
        };

        match entry.channel.try_recv_head() {
            IoOutcome::Idle => {}
            IoOutcome::Pending => {
                let deadline = entry.channel.head_recv_deadline();
                selector.request(fd, Ops::read(), deadline)?;
            }
            IoOutcome::Done => {
                let mut op = entry.channel.pop_recv().expect("head recv op");
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.recv_cb)(&mut ctl, fd, Status::Ok, &mut op.buf);

                // one completion per event; later buffers continue on the
                // next readable
                if entry.channel.has_recv_pending() {
                    let deadline = entry.channel.head_recv_deadline();
                    selector.request(fd, Ops::read(), deadline)?;
                }
            }
            IoOutcome::Failed(e) => {
                warn!("recv failed, fd {}: {}", fd, e);
                let mut op = entry.channel.pop_recv().expect("head recv op");
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.recv_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
                // buffers behind the failed head await shutdown or close
            }
        }

        Ok(())
    }

    fn on_channel_writable(&mut self, fd: RawFd) -> Result<()> {
        let Server {
            selector,
            channels,
            commands,
            ..
        } = self;

        let Some(entry) = channels.get_mut(&fd) else {
            return Ok(());
        };

        if entry.channel.state() == ChannelState::Opening {
            match socket::take_error(fd) {
                Ok(None) => {
                    entry.channel.set_open();
                    trace!("channel connected, fd: {}", fd);

                    if let Some(cb) = entry.connect_cb.as_mut() {
                        let mut ctl = Control {
                            commands: &mut *commands,
                        };
                        cb(&mut ctl, fd, Status::Ok);
                    }

                    // operations queued while opening start now
                    if entry.channel.has_send_pending() {
                        selector.request(fd, Ops::write(), entry.channel.head_send_deadline())?;
                    }
                    if entry.channel.has_recv_pending() {
                        selector.request(fd, Ops::read(), entry.channel.head_recv_deadline())?;
                    }
                }
                Ok(Some(e)) | Err(e) => {
                    warn!("connect failed, fd {}: {}", fd, e);
                    if let Some(cb) = entry.connect_cb.as_mut() {
                        let mut ctl = Control {
                            commands: &mut *commands,
                        };
                        cb(&mut ctl, fd, Status::Error);
                    }
                    commands.push_back(Command::Close { fd });
                }
            }

            return Ok(());
        }

        match entry.channel.try_send_head() {
            IoOutcome::Idle => {}
            IoOutcome::Pending => {
                let deadline = entry.channel.head_send_deadline();
                selector.request(fd, Ops::write(), deadline)?;
            }
            IoOutcome::Done => {
                let mut op = entry.channel.pop_send().expect("head send op");
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.send_cb)(&mut ctl, fd, Status::Ok, &mut op.buf);

                if entry.channel.has_send_pending() {
                    let deadline = entry.channel.head_send_deadline();
                    selector.request(fd, Ops::write(), deadline)?;
                }
            }
            IoOutcome::Failed(e) => {
                warn!("send failed, fd {}: {}", fd, e);
                let mut op = entry.channel.pop_send().expect("head send op");
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.send_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
            }
        }

        Ok(())
    }

    /// Fd-level failure: a connect in flight fails, otherwise every queued
    /// operation fails with `Status::Error` and the channel closes.
    fn on_channel_error(&mut self, fd: RawFd) -> Result<()> {
        let Server {
            channels, commands, ..
        } = self;

        let Some(entry) = channels.get_mut(&fd) else {
            return Ok(());
        };

        if entry.channel.state() == ChannelState::Opening {
            warn!("connect error event, fd: {}", fd);
            if let Some(cb) = entry.connect_cb.as_mut() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                cb(&mut ctl, fd, Status::Error);
            }
            commands.push_back(Command::Close { fd });
            return Ok(());
        }

        warn!("channel error event, fd: {}", fd);

        let send_ops = entry.channel.take_send_ops();
        for mut op in send_ops {
            let mut ctl = Control {
                commands: &mut *commands,
            };
            (entry.send_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
        }

        let recv_ops = entry.channel.take_recv_ops();
        for mut op in recv_ops {
            let mut ctl = Control {
                commands: &mut *commands,
            };
            (entry.recv_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
        }

        commands.push_back(Command::Close { fd });

        Ok(())
    }

    fn on_channel_timeout(&mut self, fd: RawFd, set: EventSet) -> Result<()> {
        let Server {
            channels, commands, ..
        } = self;

        let Some(entry) = channels.get_mut(&fd) else {
            return Ok(());
        };

        trace!("channel timeout, fd: {}, set: {:?}", fd, set);

        if entry.channel.state() == ChannelState::Opening && set.is_write() {
            if let Some(cb) = entry.connect_cb.as_mut() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                cb(&mut ctl, fd, Status::Error);
            }
            commands.push_back(Command::Close { fd });
            return Ok(());
        }

        if set.is_read() {
            if let Some(mut op) = entry.channel.pop_recv() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.recv_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
            }
        }

        if set.is_write() {
            if let Some(mut op) = entry.channel.pop_send() {
                let mut ctl = Control {
                    commands: &mut *commands,
                };
                (entry.send_cb)(&mut ctl, fd, Status::Error, &mut op.buf);
            }
        }

        Ok(())
    }
}
