//! Proxy configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::dialer::{Direct, DirectMode, DirectOptions, DEFAULT_DIAL_TIMEOUT};
use crate::error::{ProxyError, Result};
use crate::http::DEFAULT_MAX_HEADER_BYTES;
use crate::relay::{RelayOptions, DEFAULT_DRAIN_TIMEOUT};

/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;

/// Default time allowed for a client to send its request head
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds to
    pub listen: SocketAddr,
    /// Time allowed for the request head to arrive
    pub header_timeout: Duration,
    /// Upper bound on request head size
    pub max_header_bytes: usize,
    /// Target dialer options
    pub dial: DirectOptions,
    /// Relay options
    pub relay: RelayOptions,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            dial: DirectOptions {
                nodelay: true,
                timeout: Some(DEFAULT_DIAL_TIMEOUT),
                ..Default::default()
            },
            relay: RelayOptions::default(),
        }
    }
}

impl ProxyConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listening port, keeping the bind address.
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen.set_port(port);
        self
    }

    /// Set the listening address.
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the target dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial.timeout = Some(timeout);
        self
    }

    /// Set the dialer IP version preference.
    pub fn with_dial_mode(mut self, mode: DirectMode) -> Self {
        self.dial.mode = mode;
        self
    }

    /// Set the TCP keepalive idle time on target sockets; `None` leaves the
    /// system default.
    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.dial.keepalive = idle;
        self
    }

    /// Set the request head timeout.
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Set the request head size limit.
    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    /// Set the tunnel idle timeout; `None` disables it.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay.idle_timeout = timeout;
        self
    }

    /// Set the drain window after one side's EOF.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.relay.drain_timeout = timeout;
        self
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.header_timeout.is_zero() {
            return Err(ProxyError::Config(
                "header timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_header_bytes == 0 {
            return Err(ProxyError::Config(
                "max header bytes must be greater than zero".to_string(),
            ));
        }
        if self.relay.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ProxyError::Config(
                "idle timeout must be greater than zero (omit it to disable)".to_string(),
            ));
        }
        if self.dial.keepalive.is_some_and(|t| t.is_zero()) {
            return Err(ProxyError::Config(
                "keepalive must be greater than zero (omit it to disable)".to_string(),
            ));
        }
        if self.dial.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ProxyError::Config(
                "dial timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the target dialer described by this config.
    pub fn dialer(&self) -> Result<Direct> {
        Direct::with_options(self.dial.clone())
    }
}
