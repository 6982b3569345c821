use thiserror::Error;

use crate::capsule::{CodecError, MAX_REASON_LEN};
use crate::connect::ConnectError;

/// A terminal session outcome, surfaced by [`crate::Session::closed`] and
/// carried into every stream-level error once the session dies.
///
/// Graceful closes are modeled as the [`SessionError::Closed`] variant so
/// that `closed()` resolves exactly once with the full close information,
/// whether the session ended politely or not.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The transport reported a fatal error before the session was ready.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated the protocol; includes capsule framing errors.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying socket or HTTP layer failed.
    #[error("transport i/o error: {0}")]
    TransportIo(String),

    /// A local close carried a reason longer than the wire format allows.
    #[error("close reason exceeds {MAX_REASON_LEN} bytes")]
    ReasonTooLong,

    /// The session closed gracefully, locally or by the peer.
    #[error("session closed: code={code} reason={reason:?}")]
    Closed { code: u32, reason: String },
}

impl SessionError {
    /// The `{code, reason}` pair for a graceful close, if this was one.
    pub fn close_info(&self) -> Option<(u32, &str)> {
        match self {
            SessionError::Closed { code, reason } => Some((*code, reason)),
            _ => None,
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

/// An error when writing to a [`crate::SendStream`].
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum WriteError {
    /// The peer asked us to stop sending on this stream.
    #[error("stopped by peer: code={0}")]
    Stopped(u32),

    /// The local side already sent its final write, or reset the stream.
    #[error("stream closed")]
    ClosedStream,

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// An error when reading from a [`crate::RecvStream`].
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ReadError {
    /// The peer reset the sending side of this stream.
    #[error("reset by peer: code={0}")]
    Reset(u32),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// An error returned by [`crate::RecvStream::read_to_end`].
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ReadToEndError {
    #[error("stream longer than the size limit")]
    TooLong,

    #[error("read error: {0}")]
    Read(#[from] ReadError),
}

/// An error returned when connecting a WebTransport session.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The peer rejected the upgrade with a non-2xx status.
    #[error("connect rejected: status {0}")]
    Rejected(http::StatusCode),

    #[error("handshake timed out")]
    Timeout,

    #[error("failed to exchange connect preamble")]
    Connect(#[from] ConnectError),

    #[error("invalid URL")]
    InvalidUrl,
}

/// An error returned when accepting a WebTransport session.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to exchange connect preamble")]
    Connect(#[from] ConnectError),

    #[error("handshake timed out")]
    Timeout,
}
