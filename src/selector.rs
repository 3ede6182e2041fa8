use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, ops};

use concurrent_queue::ConcurrentQueue;
use log::{trace, warn};

use crate::clock::{self, Deadline};
use crate::event::{Event, EventSet, Events, Ops};
use crate::sys::epoll::{self, Epoll};
use crate::waker::Waker;
use crate::{Error, Result};

/// Selector construction options.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SelectorOptions(u8);

const THREAD_SAFE: u8 = 0b0001;

impl SelectorOptions {
    pub fn empty() -> SelectorOptions {
        SelectorOptions(0)
    }

    /// Allows `remote()` and `waker()` handles that post requests from other
    /// threads.
    pub fn thread_safe() -> SelectorOptions {
        SelectorOptions(THREAD_SAFE)
    }

    pub fn is_thread_safe(&self) -> bool {
        self.0 & THREAD_SAFE != 0
    }
}

impl ops::BitOr for SelectorOptions {
    type Output = SelectorOptions;

    fn bitor(self, other: SelectorOptions) -> SelectorOptions {
        SelectorOptions(self.0 | other.0)
    }
}

/// A deferred request posted from a non-loop thread, applied by the loop
/// thread before the next wait.
#[derive(Debug)]
enum Request {
    Interest {
        fd: RawFd,
        ops: Ops,
        deadline: Deadline,
    },
    Remove {
        fd: RawFd,
    },
}

struct Inbox {
    requests: ConcurrentQueue<Request>,
    waker: Waker,
}

/// The cross-thread face of a thread-safe selector.
#[derive(Clone)]
pub struct Remote {
    inbox: Arc<Inbox>,
}

impl Remote {
    /// Posts an interest request and wakes the loop.
    pub fn request(&self, fd: RawFd, ops: Ops, deadline: Deadline) -> Result<()> {
        self.post(Request::Interest { fd, ops, deadline })
    }

    /// Posts a deregistration and wakes the loop.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.post(Request::Remove { fd })
    }

    pub fn wakeup(&self) -> Result<()> {
        self.inbox.waker.wake()?;
        Ok(())
    }

    pub fn waker(&self) -> Waker {
        self.inbox.waker.clone()
    }

    fn post(&self, req: Request) -> Result<()> {
        self.inbox
            .requests
            .push(req)
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "selector gone")))?;
        self.inbox.waker.wake()?;
        Ok(())
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Remote")
    }
}

#[derive(Clone)]
struct Entry {
    fd: RawFd,
    interest: Ops,
    rd_seq: u64,
    wr_seq: u64,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            fd: -1,
            interest: Ops::empty(),
            rd_seq: 0,
            wr_seq: 0,
        }
    }
}

/// One armed deadline for a single (fd, operation) pair.
///
/// The heap orders by deadline; a node is live only while its sequence
/// number matches the owning entry's current one, so replacement and
/// consumption are O(1) and stale nodes fall out lazily.
struct ExpiryNode {
    deadline: Deadline,
    seq: u64,
    fd: RawFd,
    op: Ops,
}

impl PartialEq for ExpiryNode {
    fn eq(&self, other: &ExpiryNode) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ExpiryNode {}

impl Ord for ExpiryNode {
    fn cmp(&self, other: &ExpiryNode) -> Ordering {
        // reversed so the BinaryHeap pops the nearest deadline first
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ExpiryNode {
    fn partial_cmp(&self, other: &ExpiryNode) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The epoll-backed multiplexer.
///
/// Owns a per-fd state table whose interest masks mirror the kernel, an
/// expiry queue of per-operation deadlines, and an eventfd for cross-thread
/// wake-up. All methods except those on [`Remote`] and [`Waker`] must run on
/// the loop thread.
///
/// Delivery contract per poll round: for each ready fd, read before
/// error-or-write, error suppressing write; delivered interest bits are
/// cleared (the callback re-requests what it still wants); expiries fire
/// after readiness, and a readiness hit consumes the pending expiry for that
/// (fd, operation) silently.
pub struct Selector {
    ep: Epoll,
    entries: Vec<Entry>,
    expiries: BinaryHeap<ExpiryNode>,
    next_seq: u64,
    inbox: Arc<Inbox>,
    options: SelectorOptions,
    epevents: Vec<libc::epoll_event>,
    count: usize,
}

impl Selector {
    pub fn new() -> Result<Selector> {
        Selector::with_options(SelectorOptions::empty())
    }

    pub fn with_options(options: SelectorOptions) -> Result<Selector> {
        let ep = Epoll::new()?;
        let waker = Waker::new()?;

        ep.add(waker.as_raw_fd(), Ops::read())?;

        Ok(Selector {
            ep,
            entries: Vec::new(),
            expiries: BinaryHeap::new(),
            next_seq: 0,
            inbox: Arc::new(Inbox {
                requests: ConcurrentQueue::unbounded(),
                waker,
            }),
            options,
            epevents: Vec::with_capacity(1024),
            count: 0,
        })
    }

    pub fn options(&self) -> SelectorOptions {
        self.options
    }

    /// Number of registered fds, the waker excluded.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn registered(&self, fd: RawFd) -> bool {
        fd >= 0
            && self
                .entries
                .get(fd as usize)
                .map_or(false, |e| e.fd == fd)
    }

    /// The cross-thread request handle. Requires the thread-safe option.
    pub fn remote(&self) -> Result<Remote> {
        if !self.options.is_thread_safe() {
            return Err(Error::NotThreadSafe);
        }

        Ok(Remote {
            inbox: self.inbox.clone(),
        })
    }

    /// The wake-up handle alone. Requires the thread-safe option.
    pub fn waker(&self) -> Result<Waker> {
        if !self.options.is_thread_safe() {
            return Err(Error::NotThreadSafe);
        }

        Ok(self.inbox.waker.clone())
    }

    /// Registers `fd` with empty interest.
    pub fn add(&mut self, fd: RawFd) -> Result<()> {
        assert!(fd >= 0);
        let idx = fd as usize;

        if idx < self.entries.len() && self.entries[idx].fd != -1 {
            return Err(Error::AlreadyRegistered(fd));
        }

        self.ep.add(fd, Ops::empty())?;

        if idx >= self.entries.len() {
            self.entries.resize_with(idx + 1, Entry::vacant);
        }
        self.entries[idx] = Entry {
            fd,
            interest: Ops::empty(),
            rd_seq: 0,
            wr_seq: 0,
        };
        self.count += 1;

        trace!("selector add, fd: {}", fd);

        Ok(())
    }

    /// Deregisters `fd` and invalidates both of its expiry nodes.
    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let idx = self.index_of(fd)?;

        self.ep.delete(fd)?;

        let entry = &mut self.entries[idx];
        entry.fd = -1;
        entry.interest = Ops::empty();
        entry.rd_seq = 0;
        entry.wr_seq = 0;
        self.count -= 1;

        trace!("selector remove, fd: {}", fd);

        Ok(())
    }

    /// Sets or augments interest for `ops` with an absolute deadline.
    ///
    /// Re-requesting an operation that already has a pending expiry replaces
    /// the node; only one lives per (fd, operation).
    pub fn request(&mut self, fd: RawFd, ops: Ops, deadline: Deadline) -> Result<()> {
        let idx = self.index_of(fd)?;

        self.entries[idx].interest.insert(ops);
        let interest = self.entries[idx].interest;
        self.ep.modify(fd, interest)?;

        if ops.is_read() {
            self.arm(idx, Ops::read(), deadline);
        }
        if ops.is_write() {
            self.arm(idx, Ops::write(), deadline);
        }

        trace!("selector request, fd: {}, ops: {:?}", fd, ops);

        Ok(())
    }

    fn arm(&mut self, idx: usize, op: Ops, deadline: Deadline) {
        if deadline.is_never() {
            let entry = &mut self.entries[idx];
            if op.is_read() {
                entry.rd_seq = 0;
            } else {
                entry.wr_seq = 0;
            }
            return;
        }

        self.next_seq += 1;
        let seq = self.next_seq;

        let entry = &mut self.entries[idx];
        if op.is_read() {
            entry.rd_seq = seq;
        } else {
            entry.wr_seq = seq;
        }

        self.expiries.push(ExpiryNode {
            deadline,
            seq,
            fd: entry.fd,
            op,
        });
    }

    /// One turn of the loop: apply deferred requests, wait at most
    /// `min(default_wait, nearest deadline)`, translate readiness into
    /// `events`, then append expired deadlines.
    ///
    /// Returns the raw count `epoll_wait` reported; zero means the wait
    /// timed out idle. A wake-up makes the count positive while contributing
    /// no event.
    pub fn poll(&mut self, events: &mut Events, default_wait: Option<Duration>) -> Result<usize> {
        events.clear();

        self.drain_requests();

        let timeout = self.wait_timeout(default_wait);

        if self.epevents.capacity() < self.count + 1 {
            let extra = self.count + 1 - self.epevents.capacity();
            self.epevents.reserve(extra);
        }

        let n = {
            let Selector { ep, epevents, .. } = &mut *self;
            ep.wait(epevents, timeout)?
        };

        for i in 0..self.epevents.len() {
            let epevt = self.epevents[i];
            let fd = epevt.u64 as RawFd;

            if fd == self.inbox.waker.as_raw_fd() {
                trace!("selector woken");
                let _ = self.inbox.waker.drain();
                continue;
            }

            let Some(entry) = self.entries.get_mut(fd as usize) else {
                continue;
            };
            if entry.fd != fd {
                continue;
            }

            let set = epoll::epoll_to_set(epevt.events);

            if set.is_read() {
                events.push(Event::new(fd, EventSet::read()));
                entry.rd_seq = 0;
                entry.interest.remove(Ops::read());
            }
            if set.is_error() {
                events.push(Event::new(fd, EventSet::error()));
                entry.rd_seq = 0;
                entry.wr_seq = 0;
                entry.interest = Ops::empty();
            } else if set.is_write() {
                events.push(Event::new(fd, EventSet::write()));
                entry.wr_seq = 0;
                entry.interest.remove(Ops::write());
            }

            let interest = entry.interest;
            self.ep.modify(fd, interest)?;
        }

        self.sweep_expired(events)?;

        Ok(n)
    }

    fn drain_requests(&mut self) {
        while let Ok(req) = self.inbox.requests.pop() {
            let r = match req {
                Request::Interest { fd, ops, deadline } => self.request(fd, ops, deadline),
                Request::Remove { fd } => self.remove(fd),
            };

            if let Err(e) = r {
                // the fd may have gone away before the deferred request ran
                warn!("deferred request dropped: {}", e);
            }
        }
    }

    fn wait_timeout(&mut self, default_wait: Option<Duration>) -> Option<Duration> {
        match self.nearest_deadline() {
            None => default_wait,
            Some(exp) => {
                let wait = Duration::from_millis(exp.until_ms(clock::now()));
                Some(match default_wait {
                    Some(dw) => dw.min(wait),
                    None => wait,
                })
            }
        }
    }

    fn nearest_deadline(&mut self) -> Option<Deadline> {
        loop {
            let (live, deadline) = match self.expiries.peek() {
                None => return None,
                Some(node) => (self.is_live(node), node.deadline),
            };

            if live {
                return Some(deadline);
            }
            self.expiries.pop();
        }
    }

    fn sweep_expired(&mut self, events: &mut Events) -> Result<()> {
        let now = clock::now();

        loop {
            let fd = match self.expiries.peek() {
                None => break,
                Some(node) => {
                    if !self.is_live(node) {
                        -1
                    } else if node.deadline.expired(now) {
                        node.fd
                    } else {
                        break;
                    }
                }
            };

            let node = self.expiries.pop().expect("peeked node");
            if fd < 0 {
                continue;
            }

            let entry = &mut self.entries[fd as usize];
            if node.op.is_read() {
                entry.rd_seq = 0;
            } else {
                entry.wr_seq = 0;
            }
            entry.interest.remove(node.op);
            let interest = entry.interest;

            events.push(Event::new(fd, EventSet::timeout(node.op)));
            self.ep.modify(fd, interest)?;

            trace!("selector timeout, fd: {}, op: {:?}", fd, node.op);
        }

        Ok(())
    }

    fn is_live(&self, node: &ExpiryNode) -> bool {
        match self.entries.get(node.fd as usize) {
            Some(e) if e.fd == node.fd => {
                let seq = if node.op.is_read() {
                    e.rd_seq
                } else {
                    e.wr_seq
                };
                seq == node.seq
            }
            _ => false,
        }
    }

    fn index_of(&self, fd: RawFd) -> Result<usize> {
        if self.registered(fd) {
            Ok(fd as usize)
        } else {
            Err(Error::UnknownFd(fd))
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Selector")
            .field("count", &self.count)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::eventfd::EventFd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn double_add_rejected() {
        let efd = EventFd::new().unwrap();
        let mut sel = Selector::new().unwrap();

        sel.add(efd.as_raw_fd()).unwrap();
        assert!(matches!(
            sel.add(efd.as_raw_fd()),
            Err(Error::AlreadyRegistered(_))
        ));

        sel.remove(efd.as_raw_fd()).unwrap();
        assert!(matches!(
            sel.remove(efd.as_raw_fd()),
            Err(Error::UnknownFd(_))
        ));
    }

    #[test]
    fn readiness_consumes_interest() {
        let efd = EventFd::new().unwrap();
        let fd = efd.as_raw_fd();

        let mut sel = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(fd).unwrap();
        sel.request(fd, Ops::read(), Deadline::NEVER).unwrap();

        efd.write(1).unwrap();
        sel.poll(&mut events, Some(Duration::from_millis(100)))
            .unwrap();

        assert_eq!(events.len(), 1);
        let ev = events.get(0).unwrap();
        assert_eq!(ev.fd(), fd);
        assert!(ev.events().is_read());
        assert!(!ev.events().is_timeout());

        // interest was cleared on delivery; nothing more arrives
        efd.read().unwrap();
        efd.write(1).unwrap();
        let mut events = Events::with_capacity(8);
        sel.poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn past_deadline_fires_without_blocking() {
        let efd = EventFd::new().unwrap();
        let fd = efd.as_raw_fd();

        let mut sel = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(fd).unwrap();
        sel.request(fd, Ops::read(), Deadline::at(clock::now() - 1))
            .unwrap();

        let start = clock::now();
        sel.poll(&mut events, Some(Duration::from_secs(10))).unwrap();
        let took = clock::now() - start;

        assert!(took < 1_000_000, "poll blocked for {}us", took);
        assert_eq!(events.len(), 1);
        let ev = events.get(0).unwrap();
        assert!(ev.events().is_timeout());
        assert!(ev.events().is_read());
    }

    #[test]
    fn rearm_replaces_expiry() {
        let efd = EventFd::new().unwrap();
        let fd = efd.as_raw_fd();

        let mut sel = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(fd).unwrap();
        sel.request(fd, Ops::read(), Deadline::at(clock::now() - 1))
            .unwrap();
        // the fresh deadline supersedes the expired one
        sel.request(fd, Ops::read(), Deadline::after(Duration::from_secs(60)))
            .unwrap();

        sel.poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn readiness_beats_timeout() {
        let efd = EventFd::new().unwrap();
        let fd = efd.as_raw_fd();

        let mut sel = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(fd).unwrap();
        sel.request(fd, Ops::read(), Deadline::at(clock::now() - 1))
            .unwrap();
        efd.write(1).unwrap();

        sel.poll(&mut events, Some(Duration::from_millis(100)))
            .unwrap();

        // one readiness event, the expiry consumed silently
        assert_eq!(events.len(), 1);
        assert!(events.get(0).unwrap().events().is_read());
        assert!(!events.get(0).unwrap().events().is_timeout());
    }

    #[test]
    fn read_delivered_before_write() {
        let (a, b) = crate::sys::socket::pair().unwrap();

        let mut sel = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(a).unwrap();
        crate::sys::socket::send(b, b"x").unwrap();

        // both operations ready at once: readable data is pending and the
        // socket buffer has room to write
        sel.request(a, Ops::read() | Ops::write(), Deadline::NEVER)
            .unwrap();
        sel.poll(&mut events, Some(Duration::from_millis(500)))
            .unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.get(0).unwrap().events().is_read());
        assert!(events.get(1).unwrap().events().is_write());
        assert_eq!(events.get(0).unwrap().fd(), a);
        assert_eq!(events.get(1).unwrap().fd(), a);

        let _ = crate::sys::socket::close(a);
        let _ = crate::sys::socket::close(b);
    }

    #[test]
    fn remote_requires_thread_safe() {
        let sel = Selector::new().unwrap();
        assert!(matches!(sel.remote(), Err(Error::NotThreadSafe)));
        assert!(matches!(sel.waker(), Err(Error::NotThreadSafe)));

        let sel = Selector::with_options(SelectorOptions::thread_safe()).unwrap();
        assert!(sel.remote().is_ok());
    }

    #[test]
    fn cross_thread_request_applies() {
        let efd = EventFd::new().unwrap();
        let fd = efd.as_raw_fd();

        let mut sel = Selector::with_options(SelectorOptions::thread_safe()).unwrap();
        let mut events = Events::with_capacity(8);

        sel.add(fd).unwrap();
        efd.write(1).unwrap();

        let remote = sel.remote().unwrap();
        let t = std::thread::spawn(move || {
            remote.request(fd, Ops::read(), Deadline::NEVER).unwrap();
        });
        t.join().unwrap();

        // first poll wakes on the eventfd and applies the request; the
        // readiness itself lands no later than the second poll
        let mut rounds = 0;
        while events.is_empty() && rounds < 3 {
            sel.poll(&mut events, Some(Duration::from_millis(200)))
                .unwrap();
            rounds += 1;
        }

        assert_eq!(events.len(), 1);
        assert!(events.get(0).unwrap().events().is_read());
    }
}
