//! Bidirectional byte relay between the client and target channels.
//!
//! Client to target runs on a spawned task, target to client on the calling
//! task. When one direction reaches EOF it half-closes its write side and the
//! other direction gets a bounded drain window. An I/O error, the idle
//! timeout or cancellation ends both directions at once. Either way both
//! channels are dropped, and so closed, before [`relay`] returns.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dialer::Channel;

/// Default time the surviving direction gets after the other one hit EOF
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-direction copy buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Close the tunnel after this long without traffic in either direction.
    /// `None` keeps quiet tunnels open until a side closes.
    pub idle_timeout: Option<Duration>,
    /// How long the other direction may keep flushing after one side's EOF
    pub drain_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Why a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client sent EOF first
    ClientClosed,
    /// Target sent EOF first
    TargetClosed,
    /// I/O error on either channel
    Error,
    /// No traffic for the idle timeout
    IdleTimeout,
    /// Cancelled from outside (server shutdown)
    Cancelled,
}

/// Byte counts and end reason of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client to target
    pub upstream_bytes: u64,
    /// Bytes copied target to client
    pub downstream_bytes: u64,
    /// Why the relay ended
    pub end: RelayEnd,
}

/// Shared traffic counters for one tunnel.
struct Meter {
    started: Instant,
    last_activity_ms: AtomicU64,
    upstream: AtomicU64,
    downstream: AtomicU64,
}

impl Meter {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            upstream: AtomicU64::new(0),
            downstream: AtomicU64::new(0),
        }
    }

    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn stats(&self, end: RelayEnd) -> RelayStats {
        RelayStats {
            upstream_bytes: self.upstream.load(Ordering::Relaxed),
            downstream_bytes: self.downstream.load(Ordering::Relaxed),
            end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

/// Copy until EOF, then half-close the writer.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    meter: Arc<Meter>,
    direction: Direction,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        meter.record(direction, n);
    }
    writer.shutdown().await
}

/// Resolves once the tunnel has been quiet for `idle`; never without one.
async fn idle_expired(meter: &Meter, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };
    loop {
        let quiet = meter.quiet_for();
        if quiet >= idle {
            return;
        }
        tokio::time::sleep(idle - quiet).await;
    }
}

/// Resolves once the watch value turns `true`. A dropped sender never cancels.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

fn end_of(result: io::Result<()>, on_eof: RelayEnd) -> RelayEnd {
    match result {
        Ok(()) => on_eof,
        Err(e) => {
            debug!(error = %e, "relay I/O error");
            RelayEnd::Error
        }
    }
}

fn joined(result: std::result::Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    result.unwrap_or_else(|e| Err(io::Error::other(e)))
}

/// Give the surviving direction up to `window` to finish.
async fn drain<F>(other: F, window: Duration, shutdown: &mut watch::Receiver<bool>)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = tokio::time::timeout(window, other) => {}
        _ = cancelled(shutdown) => {}
    }
}

/// Relay bytes between `client` and `target` until the tunnel ends.
///
/// Flipping `shutdown` to `true` cancels the tunnel.
pub async fn relay(
    client: Box<dyn Channel>,
    target: Box<dyn Channel>,
    options: &RelayOptions,
    mut shutdown: watch::Receiver<bool>,
) -> RelayStats {
    let meter = Arc::new(Meter::new());
    let (client_r, client_w) = tokio::io::split(client);
    let (target_r, target_w) = tokio::io::split(target);

    let mut upstream: JoinHandle<io::Result<()>> = tokio::spawn(copy_half(
        client_r,
        target_w,
        meter.clone(),
        Direction::Upstream,
    ));
    let downstream = copy_half(target_r, client_w, meter.clone(), Direction::Downstream);
    tokio::pin!(downstream);

    let idle = idle_expired(&meter, options.idle_timeout);
    tokio::pin!(idle);

    // A JoinHandle must not be polled again once it has completed
    let mut upstream_done = false;

    let end = tokio::select! {
        result = &mut upstream => {
            upstream_done = true;
            let end = end_of(joined(result), RelayEnd::ClientClosed);
            if end == RelayEnd::ClientClosed {
                let rest = async {
                    let _ = (&mut downstream).await;
                };
                drain(rest, options.drain_timeout, &mut shutdown).await;
            }
            end
        }
        result = &mut downstream => {
            let end = end_of(result, RelayEnd::TargetClosed);
            if end == RelayEnd::TargetClosed {
                let rest = async {
                    let _ = (&mut upstream).await;
                    upstream_done = true;
                };
                drain(rest, options.drain_timeout, &mut shutdown).await;
            }
            end
        }
        _ = &mut idle => RelayEnd::IdleTimeout,
        _ = cancelled(&mut shutdown) => RelayEnd::Cancelled,
    };

    // Release both channels before reporting: the task owns the client read
    // half and the target write half.
    if !upstream_done {
        upstream.abort();
        let _ = upstream.await;
    }

    meter.stats(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn pair() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(64 * 1024)
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (mut client, client_side) = pair();
        let (target_side, mut target) = pair();

        let handle = tokio::spawn(async move {
            relay(
                Box::new(client_side),
                Box::new(target_side),
                &RelayOptions::default(),
                no_shutdown(),
            )
            .await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(target);
        let stats = handle.await.unwrap();
        assert_eq!(stats.upstream_bytes, 4);
        assert_eq!(stats.downstream_bytes, 5);
    }

    #[tokio::test]
    async fn test_target_eof_lets_upstream_drain() {
        let (mut client, client_side) = pair();
        let (target_side, mut target) = pair();

        let handle = tokio::spawn(async move {
            relay(
                Box::new(client_side),
                Box::new(target_side),
                &RelayOptions::default(),
                no_shutdown(),
            )
            .await
        });

        // Target is done talking but still reading
        target.shutdown().await.unwrap();
        let mut eof = Vec::new();
        client.read_to_end(&mut eof).await.unwrap();
        assert!(eof.is_empty());

        client.write_all(b"late data").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"late data");

        let stats = handle.await.unwrap();
        assert_eq!(stats.end, RelayEnd::TargetClosed);
        assert_eq!(stats.upstream_bytes, 9);
    }

    #[tokio::test]
    async fn test_drain_window_bounds_close() {
        let (client, client_side) = pair();
        let (target_side, target) = pair();

        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: Duration::from_millis(100),
        };
        // Client stays silent and open; the target closes
        drop(target);
        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            relay(Box::new(client_side), Box::new(target_side), &options, no_shutdown()),
        )
        .await
        .expect("relay must end after the drain window");
        assert_eq!(stats.end, RelayEnd::TargetClosed);
        drop(client);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_quiet_tunnel() {
        let (mut client, client_side) = pair();
        let (target_side, _target) = pair();

        let options = RelayOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        };
        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            relay(Box::new(client_side), Box::new(target_side), &options, no_shutdown()),
        )
        .await
        .expect("idle tunnel must be closed");
        assert_eq!(stats.end, RelayEnd::IdleTimeout);

        // Client channel was released
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_relay() {
        let (_client, client_side) = pair();
        let (target_side, _target) = pair();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            relay(
                Box::new(client_side),
                Box::new(target_side),
                &RelayOptions::default(),
                rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_fast_producer_slow_consumer() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (target_side, mut target) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            relay(
                Box::new(client_side),
                Box::new(target_side),
                &RelayOptions::default(),
                no_shutdown(),
            )
            .await
        });

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let producer = tokio::spawn(async move {
            target.write_all(&payload).await.unwrap();
            target.shutdown().await.unwrap();
            target
        });

        let mut received = Vec::new();
        let mut chunk = [0u8; 333];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            tokio::task::yield_now().await;
        }
        assert_eq!(received, expected);

        client.shutdown().await.unwrap();
        drop(producer.await.unwrap());
        let stats = handle.await.unwrap();
        assert_eq!(stats.downstream_bytes, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_cancelled_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let res = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(res.is_err());
    }
}
