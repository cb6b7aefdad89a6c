//! Tunnel bridge.
//!
//! Drives one CONNECT request end to end: check the method, dial the target,
//! answer the client, switch the client connection to raw mode and relay.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dialer::{Addr, Dialer};
use crate::error::ProxyError;
use crate::http::{ClientConn, Request, Status};
use crate::relay::{relay, RelayOptions, RelayStats};

/// Lifecycle states of one tunnel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Request head parsed, nothing decided yet
    Received,
    /// Method was not CONNECT; answered 405
    Rejected,
    /// Dialing the target
    Dialing,
    /// Dial failed; answered 502
    DialFailed,
    /// Client connection could not be switched to raw mode; answered 500
    HandoffFailed,
    /// Target connected and 200 sent
    Established,
    /// Copying bytes both ways
    Relaying,
    /// Relay finished, both channels released
    Closed,
}

/// What happened to one tunnel request.
#[derive(Debug)]
pub struct TunnelOutcome {
    /// Final state reached
    pub state: TunnelState,
    /// Status sent to the client, if any was sent
    pub status: Option<Status>,
    /// Relay statistics, once relaying started
    pub stats: Option<RelayStats>,
    /// The error that ended the request early, if any
    pub error: Option<ProxyError>,
}

impl TunnelOutcome {
    fn finished(state: TunnelState, status: Option<Status>, error: Option<ProxyError>) -> Self {
        Self {
            state,
            status,
            stats: None,
            error,
        }
    }
}

/// Owns the tunnel lifecycle for requests handed to it.
///
/// A bridge holds no per-tunnel state; one instance serves every connection.
pub struct Bridge {
    dialer: Arc<dyn Dialer>,
    relay: RelayOptions,
}

impl Bridge {
    /// Create a bridge that dials targets with `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>, relay: RelayOptions) -> Self {
        Self { dialer, relay }
    }

    /// Handle one request on `client` until the tunnel is over.
    ///
    /// Never fails: every error is answered on the client connection (while
    /// it is still HTTP-framed) or ends the relay, and is reported in the
    /// returned outcome.
    pub async fn handle<C>(
        &self,
        request: &Request,
        client: &mut C,
        shutdown: watch::Receiver<bool>,
    ) -> TunnelOutcome
    where
        C: ClientConn + ?Sized,
    {
        debug!(
            method = %request.method,
            dest = %request.target,
            host = ?request.header("Host"),
            state = ?TunnelState::Received,
            "tunnel request"
        );

        if !request.is_connect() {
            let err = ProxyError::Method(request.method.clone());
            debug!(error = %err, "rejecting non-CONNECT request");
            return self
                .respond(client, TunnelState::Rejected, Status::MethodNotAllowed, err)
                .await;
        }

        debug!(dest = %request.target, state = ?TunnelState::Dialing, "dialing target");
        let target = match Addr::parse(&request.target) {
            Ok(mut addr) => self.dialer.dial_tcp(&mut addr).await,
            Err(e) => Err(e),
        };
        let target = match target {
            Ok(target) => target,
            Err(err) => {
                warn!(dest = %request.target, error = %err, "failed to connect to target");
                return self
                    .respond(client, TunnelState::DialFailed, Status::BadGateway, err)
                    .await;
            }
        };

        // Established: switch to raw mode before anything else goes out
        let mut raw = match client.takeover() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "raw takeover not supported");
                drop(target);
                return self
                    .respond(
                        client,
                        TunnelState::HandoffFailed,
                        Status::InternalServerError,
                        err,
                    )
                    .await;
            }
        };

        let established = Status::ConnectionEstablished.encode();
        let sent = async {
            raw.write_all(&established).await?;
            raw.flush().await
        };
        if let Err(e) = sent.await {
            debug!(error = %e, "client went away before the tunnel was up");
            return TunnelOutcome::finished(
                TunnelState::Closed,
                None,
                Some(ProxyError::Relay(e)),
            );
        }
        debug!(dest = %request.target, state = ?TunnelState::Established, "tunnel established");

        debug!(state = ?TunnelState::Relaying, "relaying");
        let stats = relay(raw, target, &self.relay, shutdown).await;
        info!(
            dest = %request.target,
            up = stats.upstream_bytes,
            down = stats.downstream_bytes,
            end = ?stats.end,
            "tunnel closed"
        );

        TunnelOutcome {
            state: TunnelState::Closed,
            status: Some(Status::ConnectionEstablished),
            stats: Some(stats),
            error: None,
        }
    }

    async fn respond<C>(
        &self,
        client: &mut C,
        state: TunnelState,
        status: Status,
        err: ProxyError,
    ) -> TunnelOutcome
    where
        C: ClientConn + ?Sized,
    {
        match client.send_response(status).await {
            Ok(()) => TunnelOutcome::finished(state, Some(status), Some(err)),
            Err(e) => {
                debug!(error = %e, %status, "failed to send response");
                TunnelOutcome::finished(state, None, Some(err))
            }
        }
    }
}
