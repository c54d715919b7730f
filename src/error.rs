//! The error type returned by every fallible operation in this crate.
//!
//! Callers need to distinguish a handful of well-known situations (closed
//! client, lost connection, server-side error reply, protocol violation,
//! timeout, plain I/O) without downcasting, so `Error` is a small struct
//! wrapping an `ErrorKind` discriminant instead of a boxed trait object.

use std::fmt;
use std::io;
use std::time::Duration;

/// The error type returned by [`crate::Client`] and [`crate::Listener`] operations.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

/// The classification of an [`Error`]. Callers typically match on this to decide
/// whether to retry, give up, or just observe the failure.
#[derive(Debug)]
pub enum ErrorKind {
    /// The server replied with a `-...\r\n` error frame. The connection is healthy;
    /// only this one command failed.
    Server(ServerError),
    /// An I/O error occurred while reading or writing the socket. The connection
    /// backing the command has been (or is being) torn down.
    Io(io::Error),
    /// The command's deadline elapsed before a response was available.
    Timeout(Duration),
    /// Bytes were received that do not form a valid RESP frame, or a frame exceeded
    /// a documented size limit. The connection has been torn down.
    Protocol(String),
    /// The command was queued behind a request whose connection died before a
    /// response could be decoded for it.
    ConnectionLost,
    /// [`crate::Client::close`] (or [`crate::Listener::close`]) was called; the
    /// handle no longer accepts new commands.
    Closed,
}

/// A `-...\r\n` error reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    message: String,
}

impl ServerError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The full error message, without the leading `-` or trailing `\r\n`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The first space-delimited word of the message, e.g. `ERR` or `WRONGTYPE`.
    pub fn prefix(&self) -> &str {
        self.message.split(' ').next().unwrap_or(&self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    pub(crate) fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server(ServerError::new(message)))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol(message.into()))
    }

    pub(crate) fn timeout(d: Duration) -> Self {
        Self::new(ErrorKind::Timeout(d))
    }

    pub(crate) fn connection_lost() -> Self {
        Self::new(ErrorKind::ConnectionLost)
    }

    /// Wraps the most recent dial/handshake failure for callers that reach a
    /// Client whose slot is currently offline.
    pub(crate) fn offline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io(io::Error::new(io::ErrorKind::NotConnected, message.into())))
    }

    pub(crate) fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    /// The classification of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// `true` if this is a server-side error reply (connection remains healthy).
    pub fn is_server_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Server(_))
    }

    /// `true` if the command failed because a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    /// `true` if the handle has been closed and will never accept new commands.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed)
    }

    /// `true` if this error is connection-impacting: the connection that carried
    /// the failing command has been (or is being) discarded. I/O errors, protocol
    /// violations, and timeouts are all connection-impacting; server replies and
    /// the closed/connection-lost sentinels are not.
    pub fn is_connection_impacting(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::Protocol(_) | ErrorKind::Timeout(_))
    }

    /// The server error, if this is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match &self.kind {
            ErrorKind::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Server(e) => write!(f, "server error: {e}"),
            ErrorKind::Io(e) => write!(f, "i/o error: {e}"),
            ErrorKind::Timeout(d) => write!(f, "command timed out after {d:?}"),
            ErrorKind::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ErrorKind::ConnectionLost => write!(f, "connection lost before a response was decoded"),
            ErrorKind::Closed => write!(f, "client is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            return Error::new(ErrorKind::Timeout(Duration::default()));
        }
        Error::new(ErrorKind::Io(e))
    }
}

/// This crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;
