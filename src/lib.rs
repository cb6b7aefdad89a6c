//! connect-tunnel - a minimal HTTP CONNECT forward proxy
//!
//! A client asks the proxy to open a TCP channel to `host:port`; once the
//! target is reached the proxy answers `200 Connection Established` and from
//! then on copies bytes verbatim in both directions. TLS passes through
//! untouched.
//!
//! - `CONNECT host:port` with a reachable target: `200`, then raw relay
//! - any other method: `405 Method Not Allowed`, no dial
//! - target unreachable, refused, unresolvable or too slow: `502 Bad Gateway`
//! - client connection cannot be switched to raw mode: `500`
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use connect_tunnel::{ProxyConfig, Server};
//!
//! # async fn run() -> connect_tunnel::Result<()> {
//! let config = ProxyConfig::new()
//!     .with_port(3128)
//!     .with_dial_timeout(Duration::from_secs(10));
//!
//! let server = Server::bind(config).await?;
//! server.run().await
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http;
pub mod relay;
pub mod server;

// Re-export commonly used items
pub use bridge::{Bridge, TunnelOutcome, TunnelState};
pub use config::{ProxyConfig, DEFAULT_HEADER_TIMEOUT, DEFAULT_PORT};
pub use dialer::{Addr, Channel, Dialer, Direct, DirectMode, DirectOptions, DEFAULT_DIAL_TIMEOUT};
pub use error::{ConnectErrorKind, ProxyError, Result};
pub use http::{ClientConn, HttpConn, Request, Status};
pub use relay::{relay, RelayEnd, RelayOptions, RelayStats, DEFAULT_DRAIN_TIMEOUT};
pub use server::Server;
