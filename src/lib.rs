//! A single-threaded, epoll-driven non-blocking I/O library with a
//! callback-based server abstraction for TCP, UDP and Unix-domain sockets.
//!
//! The [`Selector`] multiplexes registered fds, tracks one optional deadline
//! per (fd, operation), and wakes across threads through an eventfd. The
//! [`Server`] composes a selector with listeners and buffered connection
//! channels and runs the dispatch loop on a single thread; user callbacks
//! run on that thread and defer their own requests through [`Control`].
//!
//! # Example
//!
//! An echo server and its client sharing one loop:
//!
//! ```no_run
//! use sable_io::{Address, ConstBuffer, Deadline, MutableBuffer, Server, Status};
//!
//! let mut server = Server::new().unwrap();
//! let addr = Address::parse("tcp://127.0.0.1:0").unwrap();
//!
//! server.add_listener(&addr, Box::new(|ctl, _lfd, cfd, _remote| {
//!     if cfd < 0 {
//!         return;
//!     }
//!     ctl.accept_channel(
//!         cfd,
//!         Box::new(|ctl, fd, status, buf| {
//!             // echo everything back
//!             if status == Status::Ok {
//!                 let len = buf.end();
//!                 if let Some(mem) = buf.detach() {
//!                     let mut out = ConstBuffer::attach(mem);
//!                     out.set_limit(len);
//!                     ctl.send(fd, out, Deadline::NEVER);
//!                 }
//!             }
//!         }),
//!         Box::new(|ctl, fd, _status, _buf| {
//!             ctl.begin_receive_some(fd, MutableBuffer::with_capacity(1024), Deadline::NEVER);
//!         }),
//!         Box::new(|_ctl, _fd| {}),
//!     );
//!     ctl.begin_receive_some(cfd, MutableBuffer::with_capacity(1024), Deadline::NEVER);
//! })).unwrap();
//!
//! server.run().unwrap();
//! ```

mod sys;

pub mod clock;

mod addr;
mod buffer;
mod channel;
mod error;
mod event;
mod listener;
mod selector;
mod server;
mod url;
mod waker;

pub use addr::{Address, Family, Transport};

pub use buffer::{ConstBuffer, MutableBuffer};

pub use channel::ChannelState;

pub use clock::Deadline;

pub use error::{Error, Result};

pub use event::{Event, EventSet, Events, Ops};

pub use listener::ListenerState;

pub use selector::{Remote, Selector, SelectorOptions};

pub use server::{
    AcceptCallback, CloseCallback, ConnectCallback, Control, IdleCallback, RecvCallback,
    SendCallback, Server, Status,
};

pub use sys::socket::SocketOptions;

pub use url::Url;

pub use waker::Waker;
