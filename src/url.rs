use std::fmt;

use crate::{Error, Result};

/// A parsed URL of the form
/// `[schema://][user[:password]@]host[:port][/path][?query]`.
///
/// Every component is kept verbatim as a string; absent components are
/// empty. An IPv6 host literal loses its surrounding brackets on parse and
/// regains them on display.
///
/// # Examples
///
/// ```
/// use sable_io::Url;
///
/// let url = Url::parse("tcp://127.0.0.1:8080").unwrap();
///
/// assert_eq!(url.schema, "tcp");
/// assert_eq!(url.host, "127.0.0.1");
/// assert_eq!(url.port, "8080");
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Url {
    pub schema: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
}

impl Url {
    pub fn parse(s: &str) -> Result<Url> {
        let mut url = Url::default();
        let mut rest = s;

        if let Some(pos) = rest.find("://") {
            url.schema = rest[..pos].to_string();
            rest = &rest[pos + 3..];
        }

        let authority_end = rest
            .find(|c| c == '/' || c == '?' || c == '#')
            .unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        rest = &rest[authority_end..];

        let hostport = match authority.find('@') {
            Some(at) => {
                let userinfo = &authority[..at];
                match userinfo.find(':') {
                    Some(colon) => {
                        url.user = userinfo[..colon].to_string();
                        url.password = userinfo[colon + 1..].to_string();
                    }
                    None => url.user = userinfo.to_string(),
                }
                &authority[at + 1..]
            }
            None => authority,
        };

        if let Some(stripped) = hostport.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| Error::Addr(format!("unterminated ipv6 literal: {}", s)))?;
            url.host = stripped[..close].to_string();

            let after = &stripped[close + 1..];
            if let Some(port) = after.strip_prefix(':') {
                url.port = port.to_string();
            } else if !after.is_empty() {
                return Err(Error::Addr(format!("garbage after ipv6 literal: {}", s)));
            }
        } else {
            // A port is present only when the rightmost of `:`, `]`, `.` is
            // the colon, so `example.com` and bare IPv6 text stay intact.
            match hostport.rfind(|c| c == ':' || c == ']' || c == '.') {
                Some(i) if hostport.as_bytes()[i] == b':' => {
                    url.host = hostport[..i].to_string();
                    url.port = hostport[i + 1..].to_string();
                }
                _ => url.host = hostport.to_string(),
            }
        }

        let path_end = rest.find(|c| c == '?' || c == '#').unwrap_or(rest.len());
        url.path = rest[..path_end].to_string();
        rest = &rest[path_end..];

        if let Some(query) = rest.strip_prefix('?') {
            let query_end = query.find('#').unwrap_or(query.len());
            url.query = query[..query_end].to_string();
        }

        Ok(url)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.schema.is_empty() {
            write!(f, "{}://", self.schema)?;
        }

        if !self.host.is_empty() {
            if !self.user.is_empty() {
                f.write_str(&self.user)?;
                if !self.password.is_empty() {
                    write!(f, ":{}", self.password)?;
                }
                f.write_str("@")?;
            }

            if self.host.contains(':') {
                write!(f, "[{}]", self.host)?;
            } else {
                f.write_str(&self.host)?;
            }

            if !self.port.is_empty() {
                write!(f, ":{}", self.port)?;
            }
        }

        if !self.path.is_empty() {
            if !self.path.starts_with('/') {
                f.write_str("/")?;
            }
            f.write_str(&self.path)?;
        }

        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Url;

    #[test]
    fn full_form() {
        let url = Url::parse("http://user:pass@[fe80::1]:9090/p?q=1").unwrap();

        assert_eq!(url.schema, "http");
        assert_eq!(url.user, "user");
        assert_eq!(url.password, "pass");
        assert_eq!(url.host, "fe80::1");
        assert_eq!(url.port, "9090");
        assert_eq!(url.path, "/p");
        assert_eq!(url.query, "q=1");

        assert_eq!(url.to_string(), "http://user:pass@[fe80::1]:9090/p?q=1");
    }

    #[test]
    fn host_only() {
        let url = Url::parse("tcp://example.com").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, "");
    }

    #[test]
    fn host_port() {
        let url = Url::parse("tcp://127.0.0.1:8080").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, "8080");
        assert_eq!(url.to_string(), "tcp://127.0.0.1:8080");
    }

    #[test]
    fn no_schema() {
        let url = Url::parse("localhost:99").unwrap();
        assert_eq!(url.schema, "");
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, "99");
    }

    #[test]
    fn unix_path() {
        let url = Url::parse("unix:///tmp/echo.sock").unwrap();
        assert_eq!(url.schema, "unix");
        assert_eq!(url.host, "");
        assert_eq!(url.path, "/tmp/echo.sock");
    }

    #[test]
    fn user_without_password() {
        let url = Url::parse("ftp://anonymous@example.com/pub").unwrap();
        assert_eq!(url.user, "anonymous");
        assert_eq!(url.password, "");
        assert_eq!(url.host, "example.com");
        assert_eq!(url.path, "/pub");
    }

    #[test]
    fn fragment_excluded() {
        let url = Url::parse("http://h/p?a=1#frag").unwrap();
        assert_eq!(url.path, "/p");
        assert_eq!(url.query, "a=1");
    }

    #[test]
    fn unterminated_ipv6_rejected() {
        assert!(Url::parse("tcp://[fe80::1:80").is_err());
    }

    #[test]
    fn roundtrip() {
        for s in [
            "tcp://127.0.0.1:8080",
            "udp6://[::1]:53",
            "unix:///var/run/app.sock",
            "http://user:pass@[fe80::1]:9090/p?q=1",
            "tcp://example.com",
        ] {
            let url = Url::parse(s).unwrap();
            assert_eq!(url.to_string(), s, "roundtrip failed for {}", s);
        }
    }
}
