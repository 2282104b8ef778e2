//! webtransd-x: bridge interface between a QUIC transport and the
//! WebTransport protocol engine.
//!
//! The QUIC implementation itself (packetization, loss recovery, TLS) lives
//! behind this seam. A transport worker feeds per-connection [`Event`]s into
//! a bounded ingress channel and drains [`Command`]s from an unbounded egress
//! channel:
//!
//! - **Ingress (worker → engine)**: bounded `tokio::mpsc`, one per
//!   connection. A slow engine backpressures the worker, which translates
//!   that into QUIC flow control.
//! - **Egress (engine → worker)**: unbounded `crossbeam` channel shared per
//!   worker. Commands are batched by the worker between I/O operations.
//!
//! All payloads cross the seam as reference-counted [`bytes::Bytes`]; the
//! buffer returns to its pool when the last reference drops.
//!
//! Streams are exposed as owned [`SendStream`]/[`RecvStream`] halves so the
//! engine can move the read side into a long-lived task while the write side
//! stays behind a lock. A peer RESET_STREAM surfaces through `AsyncRead` as
//! an `io::Error` wrapping [`StreamReset`], preserving the application error
//! code.

mod cancel;
mod connection;
mod datagram;
mod stream;

pub use cancel::{CancelSignal, Canceller};
pub use connection::ConnectionHandle;
pub use datagram::{DatagramSend, DatagramSignal};
pub use stream::{BiStream, RecvStream, SendStream, StreamReset};

use bytes::Bytes;

/// Unique identifier for a QUIC connection within its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// QUIC stream identifier (RFC 9000 Section 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Bit 0x2 clear means the stream is bidirectional.
    pub fn is_bidirectional(&self) -> bool {
        self.0 & 0x2 == 0
    }

    /// Bit 0x1 clear means the stream was initiated by the client.
    pub fn is_client_initiated(&self) -> bool {
        self.0 & 0x1 == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events delivered from the transport worker to the engine (ingress).
#[derive(Debug, Clone)]
pub enum Event {
    /// Peer opened a new stream.
    StreamOpened {
        stream_id: StreamId,
        is_bidirectional: bool,
    },
    /// Ordered stream data, possibly carrying the FIN.
    StreamData {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    /// Peer reset the stream's send side (RESET_STREAM).
    StreamReset {
        stream_id: StreamId,
        error_code: u64,
    },
    /// Peer asked us to stop sending (STOP_SENDING).
    StreamStopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    /// A QUIC DATAGRAM frame arrived.
    DatagramReceived { data: Bytes },
    /// A previously sent datagram was acknowledged.
    DatagramAcked { seq: u64 },
    /// A previously sent datagram is now considered lost.
    DatagramLost { seq: u64 },
    /// A locally requested stream open completed.
    StreamOpenedConfirm { stream_id: StreamId },
    /// Peer started closing the connection.
    ConnectionClosing { error_code: u64, reason: String },
    /// Connection is fully closed; no further events follow.
    ConnectionClosed,
}

/// Commands sent from the engine to the transport worker (egress).
#[derive(Debug)]
pub enum Command {
    OpenBiStream {
        conn_id: ConnectionId,
    },
    OpenUniStream {
        conn_id: ConnectionId,
    },
    WriteStreamData {
        conn_id: ConnectionId,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    /// Abort the write side of a stream (RESET_STREAM).
    ResetStream {
        conn_id: ConnectionId,
        stream_id: StreamId,
        error_code: u64,
    },
    /// Abort the read side of a stream (STOP_SENDING).
    StopSending {
        conn_id: ConnectionId,
        stream_id: StreamId,
        error_code: u64,
    },
    SendDatagram {
        conn_id: ConnectionId,
        /// Sequence number echoed back in `DatagramAcked`/`DatagramLost`.
        seq: u64,
        data: Bytes,
        /// Relative send priority; higher values may be scheduled first.
        priority: u8,
    },
    CloseConnection {
        conn_id: ConnectionId,
        error_code: u64,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_classification() {
        // Client bidi: 0, 4, 8...
        assert!(StreamId(4).is_bidirectional());
        assert!(StreamId(4).is_client_initiated());
        // Server bidi: 1, 5...
        assert!(StreamId(1).is_bidirectional());
        assert!(!StreamId(1).is_client_initiated());
        // Client uni: 2, 6...
        assert!(!StreamId(2).is_bidirectional());
        assert!(StreamId(2).is_client_initiated());
        // Server uni: 3, 7...
        assert!(!StreamId(3).is_bidirectional());
        assert!(!StreamId(3).is_client_initiated());
    }
}
