//! Minimal HTTP/1.x front end.
//!
//! Only what a CONNECT proxy needs: read one request head from a freshly
//! accepted socket, write a status response, and hand the socket over as a
//! raw byte pipe once the tunnel is established.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use crate::dialer::Channel;
use crate::error::{ProxyError, Result};

/// Default upper bound on the size of a request head
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

/// The tunnel-establishment method
pub const CONNECT: &str = "CONNECT";

/// How long a closing connection keeps discarding client input
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);

/// Most client input discarded while lingering
const LINGER_MAX_BYTES: u64 = 64 * 1024;

/// Response statuses the proxy emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 200, tunnel is up; raw bytes follow
    ConnectionEstablished,
    /// 400, request head could not be parsed
    BadRequest,
    /// 405, method other than CONNECT
    MethodNotAllowed,
    /// 500, the connection cannot be switched to raw mode
    InternalServerError,
    /// 502, target dial failed
    BadGateway,
}

impl Status {
    /// Numeric status code.
    pub fn code(&self) -> u16 {
        match self {
            Status::ConnectionEstablished => 200,
            Status::BadRequest => 400,
            Status::MethodNotAllowed => 405,
            Status::InternalServerError => 500,
            Status::BadGateway => 502,
        }
    }

    /// Reason phrase.
    pub fn reason(&self) -> &'static str {
        match self {
            Status::ConnectionEstablished => "Connection Established",
            Status::BadRequest => "Bad Request",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalServerError => "Internal Server Error",
            Status::BadGateway => "Bad Gateway",
        }
    }

    /// Encode the full response for this status.
    ///
    /// The 200 response is a bare status line: nothing but tunnel bytes may
    /// follow it. Error responses close the connection and carry a short
    /// plain-text body.
    pub fn encode(&self) -> Vec<u8> {
        if *self == Status::ConnectionEstablished {
            return format!("HTTP/1.1 {} {}\r\n\r\n", self.code(), self.reason()).into_bytes();
        }

        let body = format!("{}\n", self.reason());
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.code(), self.reason());
        if *self == Status::MethodNotAllowed {
            head.push_str("Allow: CONNECT\r\n");
        }
        head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        head.push_str("Connection: close\r\n\r\n");
        head.push_str(&body);
        head.into_bytes()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method, as sent
    pub method: String,
    /// Request target; `host:port` for CONNECT
    pub target: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,
    /// Header fields in arrival order
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Whether this is a tunnel-establishment request.
    pub fn is_connect(&self) -> bool {
        self.method == CONNECT
    }

    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn parse_request_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ProxyError::BadRequest(format!(
                "Invalid request line: {}",
                line
            )));
        }
        if !parts[2].starts_with("HTTP/1.") {
            return Err(ProxyError::BadRequest(format!(
                "Unsupported protocol version: {}",
                parts[2]
            )));
        }
        Ok(Self {
            method: parts[0].to_string(),
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            headers: Vec::new(),
        })
    }
}

/// Read one line within the remaining head budget.
///
/// Returns `None` on EOF before any byte.
async fn read_bounded_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => {
                ProxyError::BadRequest("Request head is not valid UTF-8".to_string())
            }
            _ => ProxyError::Io(e),
        })?;

    if n == 0 {
        if *budget == 0 {
            return Err(ProxyError::BadRequest("Request head too large".to_string()));
        }
        return Ok(None);
    }
    *budget -= n;
    if !line.ends_with('\n') {
        if *budget == 0 {
            return Err(ProxyError::BadRequest("Request head too large".to_string()));
        }
        return Err(ProxyError::BadRequest(
            "Connection closed inside request head".to_string(),
        ));
    }
    Ok(Some(line))
}

/// Read a request head (request line plus header fields) from `reader`.
///
/// Returns `Ok(None)` when the peer closes before sending anything. Bytes
/// after the blank line are left in the reader.
pub async fn read_request<R>(reader: &mut R, max_header_bytes: usize) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = max_header_bytes;

    // Tolerate stray CRLFs ahead of the request line
    let mut request = loop {
        match read_bounded_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break Request::parse_request_line(line.trim_end())?,
        }
    };

    loop {
        let line = read_bounded_line(reader, &mut budget)
            .await?
            .ok_or_else(|| ProxyError::BadRequest("Connection closed inside request head".to_string()))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("Invalid header line: {}", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ProxyError::BadRequest(format!("Invalid header name: {:?}", name)));
        }
        request
            .headers
            .push((name.to_string(), value.trim().to_string()));
    }

    Ok(Some(request))
}

/// The client side of a tunnel as seen by the bridge.
///
/// Starts out HTTP-framed. `takeover` switches it to a raw byte pipe; when
/// the transport cannot do that it returns [`ProxyError::Handoff`] and stays
/// usable for an error response.
#[async_trait]
pub trait ClientConn: Send {
    /// Write a complete response while still HTTP-framed, then close the
    /// write side.
    async fn send_response(&mut self, status: Status) -> io::Result<()>;

    /// Take exclusive raw control of the underlying transport.
    fn takeover(&mut self) -> Result<Box<dyn Channel>>;
}

/// HTTP/1.x connection over a raw socket.
pub struct HttpConn<S> {
    stream: Option<BufReader<S>>,
}

impl<S> HttpConn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a freshly accepted socket.
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
        }
    }

    /// Read the request head.
    pub async fn read_request(&mut self, max_header_bytes: usize) -> Result<Option<Request>> {
        let reader = self.stream.as_mut().ok_or_else(taken)?;
        read_request(reader, max_header_bytes).await
    }
}

/// Discard client input until EOF, bounded in time and size.
async fn linger<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut discard = tokio::io::sink();
    let mut drained = reader.take(LINGER_MAX_BYTES);
    let _ = tokio::time::timeout(LINGER_TIMEOUT, tokio::io::copy(&mut drained, &mut discard)).await;
}

fn taken() -> ProxyError {
    ProxyError::Handoff("Connection already taken over".to_string())
}

#[async_trait]
impl<S> ClientConn for HttpConn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_response(&mut self, status: Status) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection taken over"))?;
        let inner = stream.get_mut();
        inner.write_all(&status.encode()).await?;
        inner.flush().await?;
        inner.shutdown().await?;

        // Unread input at close turns the FIN into a RST, which can destroy
        // the response before the client reads it
        linger(stream).await;
        Ok(())
    }

    fn takeover(&mut self) -> Result<Box<dyn Channel>> {
        let reader = self.stream.take().ok_or_else(taken)?;

        // Anything the client pipelined behind the head belongs to the tunnel
        let buffered = reader.buffer().to_vec();
        let stream = reader.into_inner();
        if buffered.is_empty() {
            return Ok(Box::new(stream));
        }
        Ok(Box::new(Prebuffered::new(stream, buffered)))
    }
}

/// Raw channel that replays bytes read ahead by the head parser.
struct Prebuffered<S> {
    stream: S,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl<S> Prebuffered<S> {
    fn new(stream: S, buffer: Vec<u8>) -> Self {
        Self {
            stream,
            buffer,
            buffer_pos: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffer_pos < self.buffer.len() {
            let remaining = &self.buffer[self.buffer_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.buffer_pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
