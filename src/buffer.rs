use std::fmt;

/// A receive buffer: an owned byte region filled from `end` toward
/// `capacity`, consumed from `begin`.
///
/// Invariant: `begin <= end <= capacity`. The filled region and the capacity
/// are tracked independently, so a short read can never expose bytes that
/// were not written.
///
/// `detach` transfers the backing memory out; a detached buffer has zero
/// capacity and all accessors yield empty slices.
pub struct MutableBuffer {
    data: Option<Box<[u8]>>,
    begin: usize,
    end: usize,
}

impl MutableBuffer {
    pub fn with_capacity(capacity: usize) -> MutableBuffer {
        MutableBuffer {
            data: Some(vec![0; capacity].into_boxed_slice()),
            begin: 0,
            end: 0,
        }
    }

    /// Wraps owned memory without copying. Cursors start at zero.
    pub fn attach(data: Box<[u8]>) -> MutableBuffer {
        MutableBuffer {
            data: Some(data),
            begin: 0,
            end: 0,
        }
    }

    /// Takes the backing memory out, leaving an empty buffer behind.
    pub fn detach(&mut self) -> Option<Box<[u8]>> {
        self.begin = 0;
        self.end = 0;
        self.data.take()
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Bytes received so far, `data[begin..end]`.
    pub fn filled(&self) -> &[u8] {
        match self.data {
            Some(ref d) => &d[self.begin..self.end],
            None => &[],
        }
    }

    /// The writable tail, `data[end..capacity]`.
    pub fn spare(&mut self) -> &mut [u8] {
        match self.data {
            Some(ref mut d) => &mut d[self.end..],
            None => &mut [],
        }
    }

    /// Marks `n` more bytes as filled.
    pub fn advance(&mut self, n: usize) {
        assert!(self.end + n <= self.capacity());
        self.end += n;
    }

    /// Consumes `n` bytes from the front of the filled region.
    pub fn consume(&mut self, n: usize) {
        assert!(self.begin + n <= self.end);
        self.begin += n;
    }

    /// Unfilled room left behind the `end` cursor.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.end
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Moves the filled region to the front of the buffer.
    pub fn pullup(&mut self) {
        if self.begin == 0 {
            return;
        }

        if let Some(ref mut d) = self.data {
            d.copy_within(self.begin..self.end, 0);
        }
        self.end -= self.begin;
        self.begin = 0;
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

impl From<Vec<u8>> for MutableBuffer {
    fn from(data: Vec<u8>) -> MutableBuffer {
        MutableBuffer::attach(data.into_boxed_slice())
    }
}

impl fmt::Debug for MutableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutableBuffer")
            .field("capacity", &self.capacity())
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

/// A send buffer: owned bytes drained from `position` toward `limit`.
///
/// Invariant: `position <= limit <= capacity`. A fully drained buffer has
/// `position == limit`.
pub struct ConstBuffer {
    data: Option<Box<[u8]>>,
    position: usize,
    limit: usize,
}

impl ConstBuffer {
    /// Wraps owned memory; the whole region is pending.
    pub fn attach(data: Box<[u8]>) -> ConstBuffer {
        let limit = data.len();
        ConstBuffer {
            data: Some(data),
            position: 0,
            limit,
        }
    }

    /// Copies a slice into a fresh buffer.
    pub fn copy_from(bytes: &[u8]) -> ConstBuffer {
        ConstBuffer::attach(bytes.to_vec().into_boxed_slice())
    }

    pub fn detach(&mut self) -> Option<Box<[u8]>> {
        self.position = 0;
        self.limit = 0;
        self.data.take()
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Restricts the pending region to `data[..limit]`.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= self.capacity());
        self.limit = limit;
        self.position = self.position.min(limit);
    }

    /// Bytes still to send, `data[position..limit]`.
    pub fn pending(&self) -> &[u8] {
        match self.data {
            Some(ref d) => &d[self.position..self.limit],
            None => &[],
        }
    }

    /// Bytes already sent, `data[..position]`.
    pub fn sent(&self) -> &[u8] {
        match self.data {
            Some(ref d) => &d[..self.position],
            None => &[],
        }
    }

    /// Marks `n` more bytes as sent.
    pub fn advance(&mut self, n: usize) {
        assert!(self.position + n <= self.limit);
        self.position += n;
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// Rewinds the position so the region can be sent again.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl From<Vec<u8>> for ConstBuffer {
    fn from(data: Vec<u8>) -> ConstBuffer {
        ConstBuffer::attach(data.into_boxed_slice())
    }
}

impl fmt::Debug for ConstBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConstBuffer")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}
