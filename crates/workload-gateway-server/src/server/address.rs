//! Bind addresses for the endpoint listener.
//!
//! A [`BindAddr`] is tagged with its transport: a Unix domain socket path or a
//! TCP socket address. Addresses naming any other network are still
//! representable so configuration can carry them through, but the endpoint
//! rejects them before any I/O.
//!
//! ## Accepted forms
//!
//! | Input                      | Parsed as                         |
//! |----------------------------|-----------------------------------|
//! | `unix:///run/agent.sock`   | `Unix("/run/agent.sock")`         |
//! | `unix:agent.sock`          | `Unix("agent.sock")`              |
//! | `/run/agent.sock`          | `Unix("/run/agent.sock")`         |
//! | `tcp://127.0.0.1:8081`     | `Tcp(127.0.0.1:8081)`             |
//! | `127.0.0.1:0`              | `Tcp(127.0.0.1:0)`                |
//! | `udp://127.0.0.1:53`       | `Unsupported { network: "udp" }`  |

use core::fmt;
use core::str::FromStr;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

pub const UNIX: &str = "unix";
pub const TCP: &str = "tcp";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindAddr {
    Unix(PathBuf),
    /// Port `0` asks the OS to pick a free port; the endpoint replaces it with
    /// the bound address once listening.
    Tcp(SocketAddr),
    Unsupported { network: String, address: String },
}

impl BindAddr {
    /// Name of the transport, `unix` or `tcp` for supported addresses.
    pub fn network(&self) -> &str {
        match self {
            Self::Unix(_) => UNIX,
            Self::Tcp(_) => TCP,
            Self::Unsupported { network, .. } => network,
        }
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unsupported { address, .. } => f.write_str(address),
        }
    }
}

impl From<PathBuf> for BindAddr {
    fn from(path: PathBuf) -> Self {
        Self::Unix(path)
    }
}

impl From<SocketAddr> for BindAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseAddrError {
    #[error("bind address is empty")]
    Empty,

    #[error("invalid TCP address `{addr}`: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: AddrParseError,
    },
}

impl FromStr for BindAddr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseAddrError::Empty);
        }

        if let Some((scheme, rest)) = s.split_once("://") {
            return match scheme {
                UNIX => Ok(Self::Unix(PathBuf::from(rest))),
                TCP => parse_tcp(rest),
                other => Ok(Self::Unsupported {
                    network: other.to_string(),
                    address: rest.to_string(),
                }),
            };
        }

        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }

        parse_tcp(s)
    }
}

fn parse_tcp(s: &str) -> Result<BindAddr, ParseAddrError> {
    s.parse::<SocketAddr>()
        .map(BindAddr::Tcp)
        .map_err(|source| ParseAddrError::Tcp {
            addr: s.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_forms() {
        let expected = BindAddr::Unix(PathBuf::from("/run/agent.sock"));
        assert_eq!("unix:///run/agent.sock".parse::<BindAddr>().unwrap(), expected);
        assert_eq!("unix:/run/agent.sock".parse::<BindAddr>().unwrap(), expected);
        assert_eq!("/run/agent.sock".parse::<BindAddr>().unwrap(), expected);
        assert_eq!(expected.network(), "unix");
    }

    #[test]
    fn parses_tcp_forms() {
        let expected = BindAddr::Tcp("127.0.0.1:0".parse().unwrap());
        assert_eq!("tcp://127.0.0.1:0".parse::<BindAddr>().unwrap(), expected);
        assert_eq!("127.0.0.1:0".parse::<BindAddr>().unwrap(), expected);
        assert_eq!(expected.network(), "tcp");
        assert_eq!(expected.to_string(), "127.0.0.1:0");
    }

    #[test]
    fn keeps_unknown_networks() {
        let addr: BindAddr = "udp://127.0.0.1:53".parse().unwrap();
        assert_eq!(addr.network(), "udp");
        assert_eq!(addr.to_string(), "127.0.0.1:53");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!("".parse::<BindAddr>(), Err(ParseAddrError::Empty)));
        assert!(matches!(
            "localhost".parse::<BindAddr>(),
            Err(ParseAddrError::Tcp { .. })
        ));
    }
}
