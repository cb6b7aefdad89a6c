//! Target dialing.
//!
//! This module provides the outbound side of a tunnel:
//! - `Addr`: a `host:port` target as sent in a CONNECT request
//! - `Dialer`: the async dial interface used by the bridge
//! - `Direct`: dials the target over the local network with a bounded timeout

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ConnectErrorKind, ProxyError, Result};

mod direct;

pub use direct::{Direct, DirectMode, DirectOptions};

/// Default dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional byte channel (a TCP socket, or anything shaped like one).
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

/// Tunnel target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    /// Hostname or IP address, without IPv6 brackets
    pub host: String,
    /// Port number
    pub port: u16,
    /// Optional DNS resolution result
    pub resolve_info: Option<ResolveInfo>,
}

impl Addr {
    /// Create a new Addr
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolve_info: None,
        }
    }

    /// Parse a CONNECT authority (`host:port`, `[v6]:port`).
    ///
    /// Only the shape the transport needs is checked: a non-empty host and a
    /// numeric port. The host is not otherwise validated.
    pub fn parse(authority: &str) -> Result<Self> {
        let invalid = |why: &str| {
            ProxyError::connect(
                ConnectErrorKind::InvalidInput,
                format!("Invalid target {:?}: {}", authority, why),
            )
        };

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let port = rest[end + 1..]
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (&rest[..end], port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        // A bare IPv6 literal without brackets is ambiguous
        if host.contains(':') && !authority.starts_with('[') {
            return Err(invalid("IPv6 literal must be bracketed"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        Ok(Self::new(host, port))
    }

    /// Create a new Addr with resolve info
    pub fn with_resolve_info(mut self, info: ResolveInfo) -> Self {
        self.resolve_info = Some(info);
        self
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// DNS resolution results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveInfo {
    /// Resolved IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,
    /// Resolved IPv6 address, if any
    pub ipv6: Option<Ipv6Addr>,
    /// Error message that occurred during resolution, if any
    pub error: Option<String>,
}

impl ResolveInfo {
    /// Create ResolveInfo from a single IP address
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                ipv4: Some(v4),
                ..Default::default()
            },
            IpAddr::V6(v6) => Self {
                ipv6: Some(v6),
                ..Default::default()
            },
        }
    }

    /// Create ResolveInfo with error
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Check if any address is available
    pub fn has_address(&self) -> bool {
        self.ipv4.is_some() || self.ipv6.is_some()
    }
}

/// Async dial interface.
///
/// One call, one attempt: implementations never retry.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a TCP channel to the given address.
    async fn dial_tcp(&self, addr: &mut Addr) -> Result<Box<dyn Channel>>;
}

/// Split IP addresses into the first IPv4 and the first IPv6
pub(crate) fn split_ipv4_ipv6(ips: &[IpAddr]) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let mut ipv4 = None;
    let mut ipv6 = None;

    for ip in ips {
        match ip {
            IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(*v4),
            IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(*v6),
            _ => {}
        }
        if ipv4.is_some() && ipv6.is_some() {
            break;
        }
    }

    (ipv4, ipv6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse_hostname() {
        let addr = Addr::parse("example.com:443").unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 443);
        assert!(addr.resolve_info.is_none());
    }

    #[test]
    fn test_addr_parse_ipv6_bracketed() {
        let addr = Addr::parse("[::1]:8443").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 8443);
        assert_eq!(addr.to_string(), "[::1]:8443");
    }

    #[test]
    fn test_addr_parse_rejects_bad_shapes() {
        for bad in [
            "example.com",
            ":443",
            "example.com:",
            "example.com:http",
            "::1:443",
            "[::1",
            "[::1]443",
            "host:70000",
        ] {
            let err = Addr::parse(bad).unwrap_err();
            assert_eq!(
                err.connect_kind(),
                Some(ConnectErrorKind::InvalidInput),
                "input {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_addr_display() {
        let addr = Addr::new("example.com", 443);
        assert_eq!(format!("{}", addr), "example.com:443");
    }

    #[test]
    fn test_resolve_info_from_ip() {
        let info = ResolveInfo::from_ip("10.0.0.1".parse().unwrap());
        assert_eq!(info.ipv4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(info.ipv6.is_none());
        assert!(info.has_address());

        let info = ResolveInfo::from_error("no address found");
        assert!(!info.has_address());
    }

    #[test]
    fn test_split_ipv4_ipv6_takes_first() {
        let ips = vec![
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)),
        ];
        let (v4, v6) = split_ipv4_ipv6(&ips);
        assert_eq!(v4, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(v6, Some(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
    }

    #[test]
    fn test_split_ipv4_ipv6_empty() {
        let (v4, v6) = split_ipv4_ipv6(&[]);
        assert!(v4.is_none());
        assert!(v6.is_none());
    }
}
