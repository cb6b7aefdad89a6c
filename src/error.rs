use thiserror::Error;

/// Classifies target dial errors for programmatic matching.
///
/// The bridge answers every kind with the same `502 Bad Gateway`; the kind
/// only shows up in logs and in library callers that dial directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Connection to the remote host failed (refused, unreachable, reset)
    ConnectionFailed,
    /// Resolution plus connect did not finish within the dial timeout
    Timeout,
    /// DNS resolution failed or returned no usable address
    DnsFailed,
    /// Target is not a usable `host:port` authority
    InvalidInput,
}

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Method not allowed: {0}")]
    Method(String),

    #[error("Connect error: {message}")]
    Connect {
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("Handoff error: {0}")]
    Handoff(String),

    #[error("Relay error: {0}")]
    Relay(std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Shorthand for a [`ProxyError::Connect`] with the given kind.
    pub fn connect(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        ProxyError::Connect {
            kind,
            message: message.into(),
        }
    }

    /// The dial error kind, if this is a connect error.
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            ProxyError::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
