//! Listener front end.
//!
//! Accepts TCP connections, reads one request head per connection and hands
//! it to the [`Bridge`]. Each connection runs on its own task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::ProxyConfig;
use crate::dialer::Dialer;
use crate::error::{ProxyError, Result};
use crate::http::{ClientConn, HttpConn, Status};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// CONNECT proxy server.
pub struct Server {
    listener: TcpListener,
    bridge: Arc<Bridge>,
    config: Arc<ProxyConfig>,
}

impl Server {
    /// Bind the listener and build the direct dialer from `config`.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        let dialer = Arc::new(config.dialer()?);
        Self::bind_with_dialer(config, dialer).await
    }

    /// Bind the listener, dialing targets with `dialer`.
    pub async fn bind_with_dialer(config: ProxyConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen).await.map_err(|e| {
            ProxyError::Config(format!("failed to bind {}: {}", config.listen, e))
        })?;
        let bridge = Arc::new(Bridge::new(dialer, config.relay.clone()));
        Ok(Self {
            listener,
            bridge,
            config: Arc::new(config),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then cancel live tunnels and wait up
    /// to the drain timeout for them to close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(listen = %self.local_addr()?, "proxy listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let bridge = self.bridge.clone();
                    let config = self.config.clone();
                    let cancel = cancel_rx.clone();
                    tasks.spawn(async move {
                        serve_connection(stream, peer, &bridge, &config, cancel).await;
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        info!(active = tasks.len(), "shutting down");
        let _ = cancel_tx.send(true);
        let drained = tokio::time::timeout(self.config.relay.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "aborting connections still open");
            tasks.shutdown().await;
        }
        Ok(())
    }
}

/// Serve one accepted connection: read the head, then let the bridge run.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: &Bridge,
    config: &ProxyConfig,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    let mut conn = HttpConn::new(stream);

    let head = tokio::time::timeout(
        config.header_timeout,
        conn.read_request(config.max_header_bytes),
    )
    .await;
    let request = match head {
        Err(_) => {
            debug!(%peer, "timed out waiting for request head");
            return;
        }
        Ok(Ok(None)) => {
            debug!(%peer, "closed before sending a request");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "bad request head");
            if matches!(e, ProxyError::BadRequest(_)) {
                let _ = conn.send_response(Status::BadRequest).await;
            }
            return;
        }
        Ok(Ok(Some(request))) => request,
    };

    let outcome = bridge.handle(&request, &mut conn, shutdown).await;
    debug!(
        %peer,
        state = ?outcome.state,
        status = ?outcome.status.map(|s| s.code()),
        "connection done"
    );
}
