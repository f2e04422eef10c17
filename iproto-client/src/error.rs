//! Client error types.

use iproto_protocol::{Feature, ProtocolError, ServerError};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCause {
    /// `close()` was called, or connect failed after the socket was opened.
    Client,
    /// The server closed the socket or sent an undecodable stream.
    Server,
    /// Graceful shutdown, announced by the server or started with
    /// `shutdown_close()`.
    Shutdown,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseCause::Client => "client",
            CloseCause::Server => "server",
            CloseCause::Shutdown => "shutdown",
        })
    }
}

/// Classification of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// The host name could not be resolved.
    Resolve,
    /// No route to the host or network.
    Unreachable,
    /// The host actively refused the connection.
    Refused,
    /// The connect budget elapsed.
    Timeout,
    Other,
}

impl ConnectErrorKind {
    pub(crate) fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
            io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable => ConnectErrorKind::Unreachable,
            _ => ConnectErrorKind::Other,
        }
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectErrorKind::Resolve => "cannot resolve address",
            ConnectErrorKind::Unreachable => "host unreachable",
            ConnectErrorKind::Refused => "connection refused",
            ConnectErrorKind::Timeout => "connect timed out",
            ConnectErrorKind::Other => "connect failed",
        })
    }
}

/// Client errors.
///
/// Cloneable so that a single connect attempt can report its outcome to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("{kind} ({addr}): {message}")]
    Connect {
        addr: String,
        kind: ConnectErrorKind,
        message: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    #[error("bad greeting: {0}")]
    BadGreeting(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection is not established")]
    NotEstablished,

    #[error("Connection closed by {0}")]
    Closed(CloseCause),

    #[error("Request finished by shutdown")]
    FinishedByShutdown,

    #[error("{request} timed out after {elapsed:?}")]
    Timeout { request: String, elapsed: Duration },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("server does not support feature '{0}'")]
    FeatureNotSupported(Feature),

    #[error("Call connect before getting server details")]
    NotNegotiated,

    #[error("unknown stream {0}")]
    UnknownStream(u64),

    #[error("protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::BadGreeting(reason) => ClientError::BadGreeting(reason),
            other => ClientError::Protocol(Arc::new(other)),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl ClientError {
    pub(crate) fn connect(addr: &str, kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        ClientError::Connect {
            addr: addr.to_string(),
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// A connection error caused by an OS error, kept as the source.
    pub(crate) fn connect_io(addr: &str, kind: ConnectErrorKind, err: io::Error) -> Self {
        ClientError::Connect {
            addr: addr.to_string(),
            kind,
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    /// Returns the OS error behind a connection or I/O error.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ClientError::Connect { source, .. } => source.as_deref(),
            ClientError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Returns the kind of a connection error.
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            ClientError::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the close cause of a `Closed` error.
    pub fn close_cause(&self) -> Option<CloseCause> {
        match self {
            ClientError::Closed(cause) => Some(*cause),
            _ => None,
        }
    }

    /// Returns the server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connect { .. } => true,
            ClientError::HandshakeTimeout(_) => true,
            ClientError::Timeout { .. } => true,
            ClientError::Closed(CloseCause::Server | CloseCause::Shutdown) => true,
            ClientError::FinishedByShutdown => true,
            ClientError::Io(_) => true,
            _ => false,
        }
    }
}
