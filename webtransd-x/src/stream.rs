//! Owned stream halves over the connection's shared state.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::Shared;
use crate::{Command, ConnectionId, StreamId};

/// Peer reset of a stream's send side, carried inside the `io::Error`
/// returned by [`RecvStream`] reads so callers can recover the application
/// error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream reset by peer: {0:#x}")]
pub struct StreamReset(pub u64);

impl StreamReset {
    /// Extract a reset code from an I/O error, if one is wrapped inside.
    pub fn from_io_error(err: &io::Error) -> Option<u64> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<StreamReset>())
            .map(|reset| reset.0)
    }
}

/// Write half of a QUIC stream.
pub struct SendStream {
    conn_id: ConnectionId,
    stream_id: StreamId,
    egress: Sender<Command>,
    shared: Arc<Mutex<Shared>>,
    fin_sent: bool,
}

impl SendStream {
    pub(crate) fn new(
        conn_id: ConnectionId,
        stream_id: StreamId,
        egress: Sender<Command>,
        shared: Arc<Mutex<Shared>>,
    ) -> Self {
        SendStream {
            conn_id,
            stream_id,
            egress,
            shared,
            fin_sent: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Abort the write side with an application error code (RESET_STREAM).
    pub fn abort_write(&mut self, error_code: u64) {
        let _ = self.egress.send(Command::ResetStream {
            conn_id: self.conn_id,
            stream_id: self.stream_id,
            error_code,
        });
        self.fin_sent = true;
    }

    fn closed_err(&self) -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
    }
}

impl AsyncWrite for SendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.lock().closed {
            return Poll::Ready(Err(self.closed_err()));
        }
        let data = Bytes::copy_from_slice(buf);
        let len = data.len();
        match self.egress.send(Command::WriteStreamData {
            conn_id: self.conn_id,
            stream_id: self.stream_id,
            data,
            fin: false,
        }) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(_) => Poll::Ready(Err(self.closed_err())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are handed to the worker immediately; nothing is buffered.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match self.egress.send(Command::WriteStreamData {
            conn_id: self.conn_id,
            stream_id: self.stream_id,
            data: Bytes::new(),
            fin: true,
        }) {
            Ok(()) => {
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Err(_) => Poll::Ready(Err(self.closed_err())),
        }
    }
}

/// Read half of a QUIC stream.
pub struct RecvStream {
    conn_id: ConnectionId,
    stream_id: StreamId,
    egress: Sender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvStream")
            .field("conn_id", &self.conn_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl RecvStream {
    pub(crate) fn new(
        conn_id: ConnectionId,
        stream_id: StreamId,
        egress: Sender<Command>,
        shared: Arc<Mutex<Shared>>,
    ) -> Self {
        RecvStream {
            conn_id,
            stream_id,
            egress,
            shared,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Abort the read side with an application error code (STOP_SENDING).
    pub fn abort_read(&mut self, error_code: u64) {
        let _ = self.egress.send(Command::StopSending {
            conn_id: self.conn_id,
            stream_id: self.stream_id,
            error_code,
        });
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let stream_id = self.stream_id;
        let mut state = self.shared.lock();

        // Entry is created even before data arrives so the waker has a home.
        let stream = state.streams.entry(stream_id).or_default();

        if let Some(mut chunk) = stream.chunks.pop_front() {
            let len = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..len]);
            chunk.advance(len);
            if !chunk.is_empty() {
                stream.chunks.push_front(chunk);
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(error_code) = stream.reset_error {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                StreamReset(error_code),
            )));
        }

        if stream.fin_received {
            // Clean end of stream.
            return Poll::Ready(Ok(()));
        }

        stream.read_waker = Some(cx.waker().clone());

        if state.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )));
        }

        Poll::Pending
    }
}

/// A bidirectional stream as a coupled pair of halves.
pub struct BiStream {
    pub send: SendStream,
    pub recv: RecvStream,
}

impl BiStream {
    pub(crate) fn new(send: SendStream, recv: RecvStream) -> Self {
        BiStream { send, recv }
    }

    pub fn stream_id(&self) -> StreamId {
        self.recv.stream_id()
    }

    /// Take the halves apart to move them into separate tasks.
    pub fn split(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}
