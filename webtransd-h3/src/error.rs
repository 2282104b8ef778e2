//! Error types and HTTP/3 + WebTransport application error codes.
//!
//! Error codes live in the HTTP/3 application error space (RFC 9114
//! Section 8.1) extended with the WebTransport draft-02 code for rejected
//! buffered streams. Stream-level protocol violations abort the offending
//! stream with one of these codes and leave the connection alive; critical
//! stream failures tear the whole connection down.

use std::fmt;
use std::io;

use thiserror::Error;
use webtransd_qpack::QpackError;
use webtransd_x::StreamReset;

/// HTTP/3 error codes used by the engine, plus the WebTransport draft-02
/// buffered-stream rejection code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    /// H3_NO_ERROR (0x0100): graceful close with nothing to signal.
    NoError = 0x0100,

    /// H3_GENERAL_PROTOCOL_ERROR (0x0101): peer violated the protocol in a
    /// way without a more specific code.
    GeneralProtocolError = 0x0101,

    /// H3_INTERNAL_ERROR (0x0102): failure inside the HTTP stack.
    InternalError = 0x0102,

    /// H3_STREAM_CREATION_ERROR (0x0103): peer created a stream we will
    /// not accept.
    StreamCreationError = 0x0103,

    /// H3_CLOSED_CRITICAL_STREAM (0x0104): a stream required by the
    /// connection (a control stream) was closed or reset.
    ClosedCriticalStream = 0x0104,

    /// H3_FRAME_UNEXPECTED (0x0105): a frame not permitted in the current
    /// state or on the current stream.
    FrameUnexpected = 0x0105,

    /// H3_FRAME_ERROR (0x0106): a frame violating layout or size rules.
    FrameError = 0x0106,

    /// H3_EXCESSIVE_LOAD (0x0107): peer behavior generating excessive load.
    ExcessiveLoad = 0x0107,

    /// H3_ID_ERROR (0x0108): a stream or session ID used incorrectly.
    IdError = 0x0108,

    /// H3_MISSING_SETTINGS (0x010a): the control stream did not start with
    /// an acceptable SETTINGS frame.
    MissingSettings = 0x010a,

    /// H3_REQUEST_REJECTED (0x010b): request refused without processing.
    RequestRejected = 0x010b,

    /// H3_REQUEST_CANCELLED (0x010c): request or response cancelled.
    RequestCancelled = 0x010c,

    /// H3_MESSAGE_ERROR (0x010e): malformed HTTP message.
    MessageError = 0x010e,

    /// H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED (0x3994bd84): a stream
    /// destined for a WebTransport session was dropped because the session
    /// is gone (draft-ietf-webtrans-http3-02).
    BufferedStreamRejected = 0x3994bd84,
}

impl ErrorCode {
    pub fn to_code(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "H3_NO_ERROR",
            Self::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            Self::InternalError => "H3_INTERNAL_ERROR",
            Self::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            Self::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            Self::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            Self::FrameError => "H3_FRAME_ERROR",
            Self::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            Self::IdError => "H3_ID_ERROR",
            Self::MissingSettings => "H3_MISSING_SETTINGS",
            Self::RequestRejected => "H3_REQUEST_REJECTED",
            Self::RequestCancelled => "H3_REQUEST_CANCELLED",
            Self::MessageError => "H3_MESSAGE_ERROR",
            Self::BufferedStreamRejected => "H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Engine failure modes.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer half-closed a stream in the middle of a frame, capsule, or
    /// varint.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Malformed frame, capsule, or header block. Carries the code the
    /// offending stream (or connection) is aborted with.
    #[error("protocol violation ({code}): {message}")]
    InvalidData { code: ErrorCode, message: String },

    /// A well-formed but unsupported construct (e.g. an unknown datagram
    /// registration format).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// API misuse or a state-machine violation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Header block or field exceeding the configured limits.
    #[error("header field too large")]
    HeaderFieldTooLarge,

    /// Caller-supplied argument out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Peer aborted the stream with an application error code.
    #[error("peer aborted stream: {0:#x}")]
    PeerAbort(u64),

    /// Value does not fit a QUIC variable-length integer.
    #[error("value out of varint range")]
    OutOfRange,

    /// The connection is closed; no further requests will arrive.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session's request stream has completed; no further streams will
    /// be accepted.
    #[error("session closed")]
    SessionClosed,

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    pub fn invalid_data(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::InvalidData {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    /// The code to abort the offending stream with.
    pub fn stream_error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidData { code, .. } => *code,
            Error::UnexpectedEof => ErrorCode::FrameError,
            Error::Cancelled => ErrorCode::RequestCancelled,
            Error::HeaderFieldTooLarge => ErrorCode::GeneralProtocolError,
            _ => ErrorCode::GeneralProtocolError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(code) = StreamReset::from_io_error(&err) {
            return Error::PeerAbort(code);
        }
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Error::UnexpectedEof;
        }
        Error::Io(err)
    }
}

impl From<QpackError> for Error {
    fn from(err: QpackError) -> Self {
        match err {
            QpackError::FieldTooLarge => Error::HeaderFieldTooLarge,
            QpackError::MethodNotConnect
            | QpackError::SchemeNotHttps
            | QpackError::ProtocolNotWebTransport => Error::InvalidOperation(err.to_string()),
            other => Error::invalid_data(ErrorCode::GeneralProtocolError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_values() {
        assert_eq!(ErrorCode::NoError.to_code(), 0x100);
        assert_eq!(ErrorCode::GeneralProtocolError.to_code(), 0x101);
        assert_eq!(ErrorCode::StreamCreationError.to_code(), 0x103);
        assert_eq!(ErrorCode::FrameUnexpected.to_code(), 0x105);
        assert_eq!(ErrorCode::FrameError.to_code(), 0x106);
        assert_eq!(ErrorCode::IdError.to_code(), 0x108);
        assert_eq!(ErrorCode::MissingSettings.to_code(), 0x10a);
        assert_eq!(ErrorCode::RequestCancelled.to_code(), 0x10c);
        assert_eq!(ErrorCode::MessageError.to_code(), 0x10e);
        assert_eq!(ErrorCode::BufferedStreamRejected.to_code(), 0x3994bd84);
    }

    #[test]
    fn io_eof_maps_to_unexpected_eof() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(err), Error::UnexpectedEof));
    }

    #[test]
    fn stream_reset_maps_to_peer_abort() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, StreamReset(0x10b));
        assert!(matches!(Error::from(err), Error::PeerAbort(0x10b)));
    }

    #[test]
    fn qpack_errors_map_by_kind() {
        assert!(matches!(
            Error::from(QpackError::FieldTooLarge),
            Error::HeaderFieldTooLarge
        ));
        assert!(matches!(
            Error::from(QpackError::MethodNotConnect),
            Error::InvalidOperation(_)
        ));
        assert!(matches!(
            Error::from(QpackError::NoDynamicTable),
            Error::InvalidData {
                code: ErrorCode::GeneralProtocolError,
                ..
            }
        ));
    }
}
