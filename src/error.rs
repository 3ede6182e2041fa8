use std::os::unix::io::RawFd;
use std::{error, fmt, io};

pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type.
///
/// `Io` wraps a failed syscall and carries the OS error. The remaining
/// variants are contract violations by the caller: they fail the API call
/// immediately and leave the event loop untouched.
#[derive(Debug)]
pub enum Error {
    /// An I/O syscall failed.
    Io(io::Error),
    /// The fd is not registered with the selector or server.
    UnknownFd(RawFd),
    /// The fd is already registered.
    AlreadyRegistered(RawFd),
    /// The channel direction was already shut down or the channel is closed.
    Closed(RawFd),
    /// The selector was built without the thread-safe option.
    NotThreadSafe,
    /// An address or URL could not be parsed or resolved.
    Addr(String),
}

impl Error {
    /// The OS `errno` when this error originated from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(src)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::UnknownFd(fd) => write!(f, "unknown fd: {}", fd),
            Error::AlreadyRegistered(fd) => write!(f, "fd already registered: {}", fd),
            Error::Closed(fd) => write!(f, "channel closed or shut down: {}", fd),
            Error::NotThreadSafe => write!(f, "selector not built with the thread-safe option"),
            Error::Addr(msg) => write!(f, "bad address: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
