use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::c_void;

/// A counter-backed eventfd used as the selector's wake-up channel.
///
/// Created non-blocking: a full counter on write and an empty counter on
/// read both surface as `WouldBlock`, which callers treat as success.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(EventFd { fd })
    }

    /// Adds `val` to the counter with a single 8-byte write.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        let n = syscall!(write(self.fd, buf.as_ptr() as *const c_void, buf.len()))?;
        debug_assert_eq!(n as usize, buf.len());
        Ok(())
    }

    /// Drains the counter with a single read, returning its value.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = syscall!(read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()))?;
        debug_assert_eq!(n as usize, buf.len());
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;
    use std::io;

    #[test]
    fn counter_accumulates() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(1).unwrap();
        assert_eq!(3, eventfd.read().unwrap());
    }

    #[test]
    fn empty_read_would_block() {
        let eventfd = EventFd::new().unwrap();
        let err = eventfd.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
