//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use crate::proto::h2::frame::Reason;

/// Result type often returned from methods that can have aeronet `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// Invalid server configuration, detected before the listener starts.
    Config,
    /// Error creating or binding a listener socket.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// TLS handshake failed.
    TlsHandshake,
    /// Peer took too long to send request headers.
    HeaderTimeout,
    /// Keep-alive idle timeout fired.
    IdleTimeout,
    /// TLS handshake did not finish within its budget.
    HandshakeTimeout,
    /// The connection send buffer exceeded its configured cap.
    OutboundOverflow,
    /// A message reached EOF before it was complete.
    IncompleteMessage,
    /// An HTTP/2 connection-level protocol error.
    Http2Connection(Reason),
    /// An HTTP/2 stream-level protocol error.
    Http2Stream(Reason),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    /// Request head grew past `max_header_bytes` without completing.
    TooLarge,
    /// Decoded body grew past `max_body_bytes`.
    BodyTooLarge,
    /// `Transfer-Encoding` other than `chunked`.
    UnsupportedTransferEncoding,
    Chunked,
}

#[derive(Debug)]
pub(crate) enum User {
    /// User tried to set a header owned by the framework.
    ReservedHeader,
    /// User set trailers without a body, or used a forbidden trailer name.
    InvalidTrailer,
    /// Handler wrote after the connection hit its outbound cap or closed.
    WriteAfterClose,
    /// Conflicting sync/streaming registration for one (path, method).
    HandlerConflict,
    /// Handler returned an error; translated to a 500.
    #[allow(unused)]
    Handler,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_config(msg: &'static str) -> Error {
        Error::new(Kind::Config).with(msg)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept(cause: std::io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_h2_conn(reason: Reason) -> Error {
        Error::new(Kind::Http2Connection(reason))
    }

    pub(crate) fn new_h2_stream(reason: Reason) -> Error {
        Error::new(Kind::Http2Stream(reason))
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was caused by invalid configuration.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if this was an I/O error on the transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a connection timeout (header, idle, or handshake) fired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::HeaderTimeout | Kind::IdleTimeout | Kind::HandshakeTimeout
        )
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the connection send buffer exceeded its cap.
    pub fn is_outbound_overflow(&self) -> bool {
        matches!(self.inner.kind, Kind::OutboundOverflow)
    }

    /// Returns the HTTP/2 error code if this is an HTTP/2 protocol error.
    pub fn h2_reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::Http2Connection(reason) | Kind::Http2Stream(reason) => Some(reason),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::BodyTooLarge) => "message body is too large",
            Kind::Parse(Parse::UnsupportedTransferEncoding) => {
                "unsupported transfer encoding"
            }
            Kind::Parse(Parse::Chunked) => "invalid chunked encoding",
            Kind::User(User::ReservedHeader) => "header is owned by the framework",
            Kind::User(User::InvalidTrailer) => "invalid trailers",
            Kind::User(User::WriteAfterClose) => "write after connection close",
            Kind::User(User::HandlerConflict) => {
                "conflicting handler registration for path and method"
            }
            Kind::User(User::Handler) => "handler failed",
            Kind::Config => "invalid server configuration",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Io => "connection error",
            Kind::TlsHandshake => "TLS handshake failed",
            Kind::HeaderTimeout => "read header timed out",
            Kind::IdleTimeout => "keep-alive idle timed out",
            Kind::HandshakeTimeout => "TLS handshake timed out",
            Kind::OutboundOverflow => "connection outbound buffer full",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Http2Connection(_) => "http2 connection error",
            Kind::Http2Stream(_) => "http2 stream error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("aeronet::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn h2_reason_surfaces() {
        let err = Error::new_h2_conn(Reason::FLOW_CONTROL_ERROR);
        assert_eq!(err.h2_reason(), Some(Reason::FLOW_CONTROL_ERROR));
        assert!(Error::new_io(std::io::Error::other("x"))
            .h2_reason()
            .is_none());
    }
}
