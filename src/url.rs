//! Endpoint URLs.
//!
//! Canonical form `<scheme>://<host-or-path>[:<port>]` with the closed scheme
//! set `tcp`, `unix`, `http`. A bare `host:port` (or bare `:port`) parses as
//! tcp. `*` as host means `0.0.0.0`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RpcError};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 12321;

/// Default endpoint when none is configured.
pub const DEFAULT_URL: &str = "tcp://127.0.0.1:12321";

/// Transport scheme, the closed set of §transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Unix,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Unix => "unix",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Url {
    /// Parse an endpoint, accepting the abbreviated `host:port` form.
    pub fn parse(input: &str) -> Result<Url> {
        let bad = || RpcError::Protocol(format!("invalid url: {input}"));

        let (scheme_str, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("tcp", input),
        };

        let scheme = match scheme_str {
            "tcp" => Scheme::Tcp,
            "unix" => Scheme::Unix,
            "http" => Scheme::Http,
            other => {
                return Err(RpcError::Protocol(format!("unsupported scheme: {other}")))
            }
        };

        if scheme == Scheme::Unix {
            let path = format!("/{}", rest.trim_start_matches('/'));
            if path == "/" {
                return Err(bad());
            }
            return Ok(Url {
                scheme,
                host: String::new(),
                port: 0,
                path,
            });
        }

        let (host_str, port_str) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        };

        let host = match host_str {
            "" => DEFAULT_HOST.to_string(),
            "*" => "0.0.0.0".to_string(),
            other => other.to_string(),
        };
        let port = match port_str {
            Some(p) => p.parse::<u16>().map_err(|_| bad())?,
            None => DEFAULT_PORT,
        };

        Ok(Url {
            scheme,
            host,
            port,
            path: String::new(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `host:port` for socket-addressed schemes.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Filesystem path for `unix` URLs.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Copy of this URL with the port replaced (used after binding port 0).
    pub fn with_port(&self, port: u16) -> Url {
        Url {
            port,
            ..self.clone()
        }
    }
}

impl FromStr for Url {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Url> {
        Url::parse(s)
    }
}

impl Default for Url {
    fn default() -> Url {
        Url::parse(DEFAULT_URL).expect("default url parses")
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Unix => write!(f, "unix://{}", self.path),
            _ => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let url = Url::parse("tcp://10.0.0.1:9000").unwrap();
        assert_eq!(url.scheme(), Scheme::Tcp);
        assert_eq!(url.addr(), "10.0.0.1:9000");
        assert_eq!(url.to_string(), "tcp://10.0.0.1:9000");
    }

    #[test]
    fn test_parse_defaults() {
        let url = Url::default();
        assert_eq!(url.to_string(), DEFAULT_URL);

        let url = Url::parse("tcp://").unwrap();
        assert_eq!(url.addr(), format!("{DEFAULT_HOST}:{DEFAULT_PORT}"));

        let url = Url::parse("tcp://somehost").unwrap();
        assert_eq!(url.addr(), format!("somehost:{DEFAULT_PORT}"));
    }

    #[test]
    fn test_parse_bare_addr_is_tcp() {
        let url = Url::parse("127.0.0.1:7357").unwrap();
        assert_eq!(url.scheme(), Scheme::Tcp);
        assert_eq!(url.addr(), "127.0.0.1:7357");

        let url = Url::parse(":7357").unwrap();
        assert_eq!(url.addr(), "127.0.0.1:7357");
    }

    #[test]
    fn test_parse_wildcard_host() {
        let url = Url::parse("tcp://*:9000").unwrap();
        assert_eq!(url.addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_parse_unix() {
        let url = Url::parse("unix:///tmp/rpc.sock").unwrap();
        assert_eq!(url.scheme(), Scheme::Unix);
        assert_eq!(url.path(), "/tmp/rpc.sock");
        assert_eq!(url.to_string(), "unix:///tmp/rpc.sock");
    }

    #[test]
    fn test_parse_http() {
        let url = Url::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(url.scheme(), Scheme::Http);
        assert_eq!(url.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Url::parse("ftp://host:1").is_err());
        assert!(Url::parse("unix://").is_err());
        assert!(Url::parse("tcp://host:notaport").is_err());
        assert!(Url::parse("tcp://host:99999").is_err());
    }

    #[test]
    fn test_with_port() {
        let url = Url::parse("tcp://127.0.0.1:0").unwrap();
        let bound = url.with_port(4444);
        assert_eq!(bound.addr(), "127.0.0.1:4444");
    }
}
