//! Direct target dialer.
//!
//! Connects to the tunnel target using the local network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::error::{ConnectErrorKind, ProxyError, Result};

use super::{split_ipv4_ipv6, Addr, Channel, Dialer, ResolveInfo, DEFAULT_DIAL_TIMEOUT};

/// IP version preference for direct connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectMode {
    /// Race IPv4 and IPv6 when both are available (default)
    #[default]
    Auto,
    /// Use IPv6 address when available, otherwise IPv4
    Prefer64,
    /// Use IPv4 address when available, otherwise IPv6
    Prefer46,
    /// Use IPv6 only, fail if not available
    Only6,
    /// Use IPv4 only, fail if not available
    Only4,
}

impl std::str::FromStr for DirectMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DirectMode::Auto),
            "64" | "prefer64" => Ok(DirectMode::Prefer64),
            "46" | "prefer46" => Ok(DirectMode::Prefer46),
            "6" | "only6" => Ok(DirectMode::Only6),
            "4" | "only4" => Ok(DirectMode::Only4),
            other => Err(ProxyError::Config(format!("unknown dial mode: {}", other))),
        }
    }
}

/// Options for creating a Direct dialer.
#[derive(Debug, Clone, Default)]
pub struct DirectOptions {
    /// IP version preference mode
    pub mode: DirectMode,
    /// Bind IPv4 address for outgoing connections
    pub bind_ip4: Option<Ipv4Addr>,
    /// Bind IPv6 address for outgoing connections
    pub bind_ip6: Option<Ipv6Addr>,
    /// Disable Nagle on the target socket
    pub nodelay: bool,
    /// TCP keepalive idle time for the target socket
    pub keepalive: Option<Duration>,
    /// Dial timeout, covering resolution and connect
    pub timeout: Option<Duration>,
}

/// Direct dialer that connects straight to the target.
///
/// IP literals are used as-is; hostnames go through the system resolver.
/// The whole attempt (resolve + connect) is bounded by a single timeout.
#[derive(Debug, Clone)]
pub struct Direct {
    mode: DirectMode,
    bind_ip4: Option<Ipv4Addr>,
    bind_ip6: Option<Ipv6Addr>,
    nodelay: bool,
    keepalive: Option<Duration>,
    timeout: Duration,
}

impl Direct {
    /// Create a new Direct dialer with default settings.
    pub fn new() -> Self {
        Self::with_mode(DirectMode::Auto)
    }

    /// Create a new Direct dialer with the given mode.
    pub fn with_mode(mode: DirectMode) -> Self {
        Self {
            mode,
            bind_ip4: None,
            bind_ip6: None,
            nodelay: true,
            keepalive: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Create a new Direct dialer with the given options.
    pub fn with_options(opts: DirectOptions) -> Result<Self> {
        let timeout = opts.timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);
        if timeout.is_zero() {
            return Err(ProxyError::Config(
                "dial timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            mode: opts.mode,
            bind_ip4: opts.bind_ip4,
            bind_ip6: opts.bind_ip6,
            nodelay: opts.nodelay,
            keepalive: opts.keepalive,
            timeout,
        })
    }

    /// Set dial timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured dial timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the address if ResolveInfo is not available yet.
    async fn resolve(&self, addr: &mut Addr) {
        if addr.resolve_info.is_some() {
            return;
        }

        if let Ok(ip) = addr.host.parse::<IpAddr>() {
            addr.resolve_info = Some(ResolveInfo::from_ip(ip));
            return;
        }

        match tokio::net::lookup_host((addr.host.as_str(), addr.port)).await {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                let (ipv4, ipv6) = split_ipv4_ipv6(&ips);
                if ipv4.is_none() && ipv6.is_none() {
                    addr.resolve_info = Some(ResolveInfo::from_error("no address found"));
                } else {
                    addr.resolve_info = Some(ResolveInfo {
                        ipv4,
                        ipv6,
                        error: None,
                    });
                }
            }
            Err(e) => {
                addr.resolve_info = Some(ResolveInfo::from_error(e.to_string()));
            }
        }
    }

    /// Get the bind IP for the given target IP.
    fn get_bind_ip(&self, target: &IpAddr) -> Option<IpAddr> {
        match target {
            IpAddr::V4(_) => self.bind_ip4.map(IpAddr::V4),
            IpAddr::V6(_) => self.bind_ip6.map(IpAddr::V6),
        }
    }

    /// Create a TCP socket bound to the configured local address.
    fn create_bound_socket(&self, ip: &IpAddr, bind_ip: IpAddr) -> Result<TcpSocket> {
        let domain = match ip {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let failed = |what: &str, e: std::io::Error| {
            ProxyError::connect(
                ConnectErrorKind::ConnectionFailed,
                format!("Failed to {}: {}", what, e),
            )
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| failed("create socket", e))?;
        socket
            .bind(&SocketAddr::new(bind_ip, 0).into())
            .map_err(|e| failed("bind", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| failed("set nonblocking", e))?;

        let std_stream: std::net::TcpStream = socket.into();
        Ok(TcpSocket::from_std_stream(std_stream))
    }

    /// Dial TCP to a specific IP address.
    async fn dial_tcp_ip(&self, ip: IpAddr, port: u16) -> Result<TcpStream> {
        let socket_addr = SocketAddr::new(ip, port);

        let connected = match self.get_bind_ip(&ip) {
            Some(bind_ip) => self.create_bound_socket(&ip, bind_ip)?.connect(socket_addr).await,
            None => TcpStream::connect(socket_addr).await,
        };

        connected.map_err(|e| {
            ProxyError::connect(
                ConnectErrorKind::ConnectionFailed,
                format!("Failed to connect to {}: {}", socket_addr, e),
            )
        })
    }

    /// Dual-stack dial TCP, racing IPv4 and IPv6 connections.
    ///
    /// Each family gets exactly one attempt. When the first to finish fails,
    /// the other attempt keeps running and its result is returned.
    async fn dual_stack_dial_tcp(
        &self,
        ipv4: Ipv4Addr,
        ipv6: Ipv6Addr,
        port: u16,
    ) -> Result<TcpStream> {
        let v4 = self.dial_tcp_ip(IpAddr::V4(ipv4), port);
        let v6 = self.dial_tcp_ip(IpAddr::V6(ipv6), port);
        tokio::pin!(v4, v6);

        tokio::select! {
            result = &mut v4 => match result {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    debug!(error = %e, "IPv4 attempt failed, waiting for IPv6");
                    v6.await
                }
            },
            result = &mut v6 => match result {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    debug!(error = %e, "IPv6 attempt failed, waiting for IPv4");
                    v4.await
                }
            },
        }
    }

    /// Pick the address to dial for single-address modes.
    fn pick_ip(&self, info: &ResolveInfo) -> Result<IpAddr> {
        let v4 = info.ipv4.map(IpAddr::V4);
        let v6 = info.ipv6.map(IpAddr::V6);
        let picked = match self.mode {
            DirectMode::Auto | DirectMode::Prefer46 => v4.or(v6),
            DirectMode::Prefer64 => v6.or(v4),
            DirectMode::Only6 => v6,
            DirectMode::Only4 => v4,
        };
        picked.ok_or_else(|| {
            let message = match self.mode {
                DirectMode::Only6 => "No IPv6 address available",
                DirectMode::Only4 => "No IPv4 address available",
                _ => "No address available",
            };
            ProxyError::connect(ConnectErrorKind::DnsFailed, message)
        })
    }

    /// Resolve and connect, without the overall timeout.
    async fn resolve_and_connect(&self, addr: &mut Addr) -> Result<TcpStream> {
        self.resolve(addr).await;

        let info = addr.resolve_info.as_ref().ok_or_else(|| {
            ProxyError::connect(ConnectErrorKind::DnsFailed, "No resolve info")
        })?;

        if !info.has_address() {
            return Err(ProxyError::connect(
                ConnectErrorKind::DnsFailed,
                info.error
                    .clone()
                    .unwrap_or_else(|| "No address available".to_string()),
            ));
        }

        if let (DirectMode::Auto, Some(ipv4), Some(ipv6)) = (self.mode, info.ipv4, info.ipv6) {
            return self.dual_stack_dial_tcp(ipv4, ipv6, addr.port).await;
        }

        let ip = self.pick_ip(info)?;
        self.dial_tcp_ip(ip, addr.port).await
    }

    /// Apply per-socket options to a freshly connected target socket.
    fn configure(&self, stream: &TcpStream) {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY");
            }
        }
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                debug!(error = %e, "failed to set TCP keepalive");
            }
        }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for Direct {
    async fn dial_tcp(&self, addr: &mut Addr) -> Result<Box<dyn Channel>> {
        let stream = tokio::time::timeout(self.timeout, self.resolve_and_connect(addr))
            .await
            .map_err(|_| {
                ProxyError::connect(
                    ConnectErrorKind::Timeout,
                    format!("Connection to {} timed out after {:?}", addr, self.timeout),
                )
            })??;

        self.configure(&stream);
        debug!(dest = %addr, peer = ?stream.peer_addr().ok(), "target connected");

        Ok(Box::new(stream))
    }
}
