//! Peer URL generation and parsing
//!
//! Peer format: huddle://<host>[:<port>]/<room>

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::DEFAULT_PORT;

const SCHEME: &str = "huddle://";

/// Where to dial a peer, and which room to ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUrl {
    /// Hostname, IPv4 literal, or bracketed IPv6 literal
    pub host: String,
    pub port: u16,
    pub room: String,
}

impl PeerUrl {
    pub fn new(host: impl Into<String>, port: u16, room: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            room: room.into(),
        }
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Format as URL string
    pub fn to_url(&self) -> String {
        format!("{}{}:{}/{}", SCHEME, self.host, self.port, self.room)
    }

    /// Parse from URL string
    pub fn parse(s: &str) -> Result<Self> {
        let s = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::Protocol("Invalid peer URL: missing huddle:// prefix".into()))?;

        let (authority, room) = s.split_once('/').unwrap_or((s, ""));
        let (host, port) = split_authority(authority)?;

        if host.is_empty() {
            return Err(Error::Protocol("Invalid peer URL: empty host".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            room: room.to_string(),
        })
    }
}

/// Split `host[:port]`, keeping brackets around IPv6 literals
fn split_authority(authority: &str) -> Result<(&str, u16)> {
    let (host, port) = if authority.starts_with('[') {
        let end = authority
            .find(']')
            .ok_or_else(|| Error::Protocol("Invalid peer URL: unclosed '['".into()))?;
        let rest = &authority[end + 1..];
        let port = match rest {
            "" => None,
            _ => Some(rest.strip_prefix(':').ok_or_else(|| {
                Error::Protocol(format!("Invalid peer URL: bad address '{}'", authority))
            })?),
        };
        (&authority[..=end], port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(p) => p
            .parse()
            .map_err(|_| Error::Protocol(format!("Invalid peer URL: bad port '{}'", p)))?,
        None => DEFAULT_PORT,
    };

    Ok((host, port))
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

impl FromStr for PeerUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url_roundtrip() {
        let url = PeerUrl::new("192.168.1.100", 7345, "team/standup");
        let parsed = PeerUrl::parse(&url.to_url()).unwrap();

        assert_eq!(parsed, url);
        assert_eq!(parsed.address(), "192.168.1.100:7345");
    }

    #[test]
    fn test_peer_url_defaults_port() {
        let url: PeerUrl = "huddle://laptop.local/standup".parse().unwrap();

        assert_eq!(url.host, "laptop.local");
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.room, "standup");
    }

    #[test]
    fn test_peer_url_parse_ipv6() {
        let url = PeerUrl::parse("huddle://[::1]:7340/standup").unwrap();
        assert_eq!(url.host, "[::1]");
        assert_eq!(url.port, 7340);
        assert_eq!(url.address(), "[::1]:7340");

        let url = PeerUrl::parse("huddle://[fe80::1]").unwrap();
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.room, "");
    }

    #[test]
    fn test_peer_url_parse_invalid() {
        // Missing prefix
        assert!(PeerUrl::parse("http://localhost/standup").is_err());

        // Bad port
        assert!(PeerUrl::parse("huddle://localhost:notaport/standup").is_err());

        // Empty host
        assert!(PeerUrl::parse("huddle://:7340/standup").is_err());

        // Unclosed IPv6 literal
        assert!(PeerUrl::parse("huddle://[::1:7340/standup").is_err());
    }
}
