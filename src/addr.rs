use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::ptr;

use libc::{c_int, socklen_t};

use crate::url::Url;
use crate::{Error, Result};

const UNIX_PATH_MAX: usize = 108;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    Unix,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Dgram,
}

/// A socket address: an IPv4/IPv6 host and port, or a Unix socket path.
///
/// Immutable value type. Parsed from URL-like strings with the schemas
/// `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6` and `unix`; a missing schema
/// means `tcp`.
///
/// # Examples
///
/// ```
/// use sable_io::{Address, Family};
///
/// let addr = Address::parse("tcp://127.0.0.1:8080").unwrap();
///
/// assert_eq!(addr.family(), Family::Inet);
/// assert_eq!(addr.port(), 8080);
/// assert_eq!(addr.to_string(), "tcp://127.0.0.1:8080");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    family: Family,
    transport: Transport,
    host: String,
    port: u16,
    path: String,
}

impl Address {
    pub fn parse(s: &str) -> Result<Address> {
        let url = Url::parse(s)?;

        let (family, transport) = match url.schema.as_str() {
            "" | "tcp" | "tcp4" => (Family::Inet, Transport::Stream),
            "tcp6" => (Family::Inet6, Transport::Stream),
            "udp" | "udp4" => (Family::Inet, Transport::Dgram),
            "udp6" => (Family::Inet6, Transport::Dgram),
            "unix" => (Family::Unix, Transport::Stream),
            other => return Err(Error::Addr(format!("unknown schema: {}", other))),
        };

        if family == Family::Unix {
            let path = if url.path.is_empty() {
                url.host
            } else {
                url.path
            };
            return Address::unix(&path);
        }

        if url.host.is_empty() {
            return Err(Error::Addr(format!("missing host: {}", s)));
        }

        let port = if url.port.is_empty() {
            0
        } else {
            url.port
                .parse::<u16>()
                .map_err(|_| Error::Addr(format!("bad port: {}", url.port)))?
        };

        Ok(Address {
            family,
            transport,
            host: url.host,
            port,
            path: String::new(),
        })
    }

    /// An IPv4 (or DNS-resolved) stream address.
    pub fn inet(host: &str, port: u16) -> Address {
        Address {
            family: Family::Inet,
            transport: Transport::Stream,
            host: host.to_string(),
            port,
            path: String::new(),
        }
    }

    /// An IPv6 stream address.
    pub fn inet6(host: &str, port: u16) -> Address {
        Address {
            family: Family::Inet6,
            transport: Transport::Stream,
            host: host.to_string(),
            port,
            path: String::new(),
        }
    }

    /// A Unix-domain stream address. The path must fit `sun_path`.
    pub fn unix(path: &str) -> Result<Address> {
        if path.is_empty() {
            return Err(Error::Addr("empty unix path".to_string()));
        }

        if path.len() >= UNIX_PATH_MAX {
            return Err(Error::Addr(format!("unix path too long: {}", path)));
        }

        Ok(Address {
            family: Family::Unix,
            transport: Transport::Stream,
            host: String::new(),
            port: 0,
            path: path.to_string(),
        })
    }

    /// The same address over a datagram transport.
    pub fn with_transport(mut self, transport: Transport) -> Address {
        self.transport = transport;
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn schema(&self) -> &'static str {
        match (self.family, self.transport) {
            (Family::Inet, Transport::Stream) => "tcp",
            (Family::Inet6, Transport::Stream) => "tcp6",
            (Family::Inet, Transport::Dgram) => "udp",
            (Family::Inet6, Transport::Dgram) => "udp6",
            (Family::Unix, _) => "unix",
        }
    }

    pub(crate) fn family_raw(&self) -> c_int {
        match self.family {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Unix => libc::AF_UNIX,
        }
    }

    pub(crate) fn type_raw(&self) -> c_int {
        match self.transport {
            Transport::Stream => libc::SOCK_STREAM,
            Transport::Dgram => libc::SOCK_DGRAM,
        }
    }

    /// Resolves to a raw sockaddr. DNS names go through the system resolver;
    /// IP literals convert directly.
    pub(crate) fn to_sockaddr(&self) -> Result<(libc::sockaddr_storage, socklen_t)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        match self.family {
            Family::Unix => {
                let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

                let bytes = self.path.as_bytes();
                debug_assert!(bytes.len() < sun.sun_path.len());
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }

                let path_off = {
                    let base = &sun as *const _ as usize;
                    &sun.sun_path as *const _ as usize - base
                };
                let len = (path_off + bytes.len() + 1) as socklen_t;

                unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_un, sun) };
                Ok((storage, len))
            }
            Family::Inet => {
                let ip = self.resolve()?;
                match ip {
                    IpAddr::V4(v4) => {
                        let sin = libc::sockaddr_in {
                            sin_family: libc::AF_INET as libc::sa_family_t,
                            sin_port: self.port.to_be(),
                            sin_addr: libc::in_addr {
                                s_addr: u32::from(v4).to_be(),
                            },
                            sin_zero: [0; 8],
                        };
                        unsafe {
                            ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin)
                        };
                        Ok((storage, mem::size_of::<libc::sockaddr_in>() as socklen_t))
                    }
                    IpAddr::V6(_) => Err(Error::Addr(format!(
                        "ipv6 host for an ipv4 address: {}",
                        self.host
                    ))),
                }
            }
            Family::Inet6 => {
                let ip = self.resolve()?;
                match ip {
                    IpAddr::V6(v6) => {
                        let sin6 = libc::sockaddr_in6 {
                            sin6_family: libc::AF_INET6 as libc::sa_family_t,
                            sin6_port: self.port.to_be(),
                            sin6_flowinfo: 0,
                            sin6_addr: libc::in6_addr {
                                s6_addr: v6.octets(),
                            },
                            sin6_scope_id: 0,
                        };
                        unsafe {
                            ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6)
                        };
                        Ok((storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t))
                    }
                    IpAddr::V4(_) => Err(Error::Addr(format!(
                        "ipv4 host for an ipv6 address: {}",
                        self.host
                    ))),
                }
            }
        }
    }

    fn resolve(&self) -> Result<IpAddr> {
        if let Ok(v4) = self.host.parse::<Ipv4Addr>() {
            return Ok(IpAddr::V4(v4));
        }
        if let Ok(v6) = self.host.parse::<Ipv6Addr>() {
            return Ok(IpAddr::V6(v6));
        }

        let want_v6 = self.family == Family::Inet6;
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Addr(format!("resolve {}: {}", self.host, e)))?;

        for sa in addrs {
            match sa {
                SocketAddr::V4(v4) if !want_v6 => return Ok(IpAddr::V4(*v4.ip())),
                SocketAddr::V6(v6) if want_v6 => return Ok(IpAddr::V6(*v6.ip())),
                _ => continue,
            }
        }

        Err(Error::Addr(format!(
            "no {} address for host: {}",
            self.schema(),
            self.host
        )))
    }

    /// Rebuilds an address from a raw sockaddr, as returned by `accept` or
    /// `getsockname`.
    pub(crate) fn from_sockaddr(
        storage: &libc::sockaddr_storage,
        len: socklen_t,
        transport: Transport,
    ) -> Option<Address> {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin =
                    unsafe { ptr::read(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(Address {
                    family: Family::Inet,
                    transport,
                    host: ip.to_string(),
                    port: u16::from_be(sin.sin_port),
                    path: String::new(),
                })
            }
            libc::AF_INET6 => {
                let sin6 =
                    unsafe { ptr::read(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(Address {
                    family: Family::Inet6,
                    transport,
                    host: ip.to_string(),
                    port: u16::from_be(sin6.sin6_port),
                    path: String::new(),
                })
            }
            libc::AF_UNIX => {
                let sun = unsafe { ptr::read(storage as *const _ as *const libc::sockaddr_un) };
                let path_off = {
                    let base = &sun as *const _ as usize;
                    &sun.sun_path as *const _ as usize - base
                };
                let path_len = (len as usize)
                    .saturating_sub(path_off)
                    .min(sun.sun_path.len());
                let bytes: Vec<u8> = sun.sun_path[..path_len]
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                Some(Address {
                    family: Family::Unix,
                    transport,
                    host: String::new(),
                    port: 0,
                    path: String::from_utf8_lossy(&bytes).into_owned(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.family == Family::Unix {
            return write!(f, "unix://{}", self.path);
        }

        write!(f, "{}://", self.schema())?;

        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }

        write!(f, ":{}", self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_schemas() {
        let a = Address::parse("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(a.family(), Family::Inet);
        assert_eq!(a.transport(), Transport::Stream);

        let a = Address::parse("udp6://[::1]:53").unwrap();
        assert_eq!(a.family(), Family::Inet6);
        assert_eq!(a.transport(), Transport::Dgram);
        assert_eq!(a.host(), "::1");

        let a = Address::parse("unix:///tmp/echo.sock").unwrap();
        assert_eq!(a.family(), Family::Unix);
        assert_eq!(a.path(), "/tmp/echo.sock");
    }

    #[test]
    fn schema_defaults_to_tcp() {
        let a = Address::parse("localhost:99").unwrap();
        assert_eq!(a.family(), Family::Inet);
        assert_eq!(a.port(), 99);
    }

    #[test]
    fn missing_port_is_zero() {
        let a = Address::parse("tcp://localhost").unwrap();
        assert_eq!(a.port(), 0);
    }

    #[test]
    fn unknown_schema_rejected() {
        assert!(Address::parse("gopher://x:1").is_err());
    }

    #[test]
    fn bad_port_rejected() {
        assert!(Address::parse("tcp://h:70000").is_err());
        assert!(Address::parse("tcp://h:x").is_err());
    }

    #[test]
    fn long_unix_path_rejected() {
        let path = format!("/tmp/{}", "x".repeat(120));
        assert!(Address::unix(&path).is_err());
    }

    #[test]
    fn display_roundtrip() {
        for s in [
            "tcp://127.0.0.1:8080",
            "tcp6://[fe80::1]:9090",
            "udp://10.0.0.1:53",
            "udp6://[::1]:0",
            "unix:///var/run/app.sock",
        ] {
            let a = Address::parse(s).unwrap();
            assert_eq!(Address::parse(&a.to_string()).unwrap(), a);
            assert_eq!(a.to_string(), s);
        }
    }

    #[test]
    fn sockaddr_roundtrip_v4() {
        let a = Address::parse("tcp://192.168.1.2:4000").unwrap();
        let (storage, len) = a.to_sockaddr().unwrap();
        let b = Address::from_sockaddr(&storage, len, Transport::Stream).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sockaddr_roundtrip_v6() {
        let a = Address::parse("tcp6://[2001:db8::7]:4000").unwrap();
        let (storage, len) = a.to_sockaddr().unwrap();
        let b = Address::from_sockaddr(&storage, len, Transport::Stream).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sockaddr_roundtrip_unix() {
        let a = Address::unix("/tmp/rt.sock").unwrap();
        let (storage, len) = a.to_sockaddr().unwrap();
        let b = Address::from_sockaddr(&storage, len, Transport::Stream).unwrap();
        assert_eq!(a, b);
    }
}
