use std::os::unix::io::RawFd;
use std::{fmt, ops};

const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const TIMEOUT: u8 = 0b1000;

/// The set of operations an fd is armed for.
///
/// `Ops` values combine with `|`:
///
/// ```
/// use sable_io::Ops;
///
/// let ops = Ops::read() | Ops::write();
///
/// assert!(ops.is_read());
/// assert!(ops.is_write());
/// ```
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ops(u8);

impl Ops {
    pub fn empty() -> Ops {
        Ops(0)
    }

    pub fn read() -> Ops {
        Ops(READ)
    }

    pub fn write() -> Ops {
        Ops(WRITE)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_read(&self) -> bool {
        self.0 & READ != 0
    }

    pub fn is_write(&self) -> bool {
        self.0 & WRITE != 0
    }

    pub fn insert(&mut self, other: Ops) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ops) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Ops {
    type Output = Ops;

    fn bitor(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [(READ, "Read"), (WRITE, "Write")];

        for (flag, name) in flags {
            if self.0 & flag != 0 {
                if one {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                one = true;
            }
        }

        if !one {
            f.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// What actually happened on an fd in one poll round.
///
/// Readable and writable readiness carry the `READ`/`WRITE` bits alone. A
/// deadline expiry carries `TIMEOUT` plus the bit of the operation that
/// expired. `ERROR` reports fd-level failure.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub fn empty() -> EventSet {
        EventSet(0)
    }

    pub fn read() -> EventSet {
        EventSet(READ)
    }

    pub fn write() -> EventSet {
        EventSet(WRITE)
    }

    pub fn error() -> EventSet {
        EventSet(ERROR)
    }

    /// An expiry of the given operations.
    pub fn timeout(ops: Ops) -> EventSet {
        let mut bits = TIMEOUT;
        if ops.is_read() {
            bits |= READ;
        }
        if ops.is_write() {
            bits |= WRITE;
        }
        EventSet(bits)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_read(&self) -> bool {
        self.0 & READ != 0
    }

    pub fn is_write(&self) -> bool {
        self.0 & WRITE != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_timeout(&self) -> bool {
        self.0 & TIMEOUT != 0
    }
}

impl ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (READ, "Read"),
            (WRITE, "Write"),
            (ERROR, "Error"),
            (TIMEOUT, "Timeout"),
        ];

        for (flag, name) in flags {
            if self.0 & flag != 0 {
                if one {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                one = true;
            }
        }

        if !one {
            f.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// One delivered event: the fd it concerns and what happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    fd: RawFd,
    events: EventSet,
}

impl Event {
    pub fn new(fd: RawFd, events: EventSet) -> Event {
        Event { fd, events }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> EventSet {
        self.events
    }
}

/// A reusable batch of delivered events, filled by `Selector::poll`.
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx).copied()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    pub fn iter(&self) -> Iter {
        Iter {
            inner: self,
            pos: 0,
        }
    }
}

impl Default for Events {
    fn default() -> Events {
        Events::with_capacity(1024)
    }
}

pub struct Iter<'a> {
    inner: &'a Events,
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let event = self.inner.get(self.pos);
        self.pos += 1;
        event
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.inner.iter()).finish()
    }
}
