//! Per-connection state shared between the handle and stream halves, plus
//! the event pump that applies ingress events to it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::datagram::{DatagramSend, ReceiptSenders};
use crate::stream::{BiStream, RecvStream, SendStream};
use crate::{Command, ConnectionId, Event, StreamId};

/// Read-side state of a single stream.
#[derive(Default)]
pub(crate) struct StreamState {
    pub(crate) chunks: VecDeque<Bytes>,
    pub(crate) fin_received: bool,
    pub(crate) reset_error: Option<u64>,
    pub(crate) read_waker: Option<Waker>,
}

/// State shared by the handle, the stream halves and the event pump.
pub(crate) struct Shared {
    pub(crate) streams: HashMap<StreamId, StreamState>,

    pending_bi: VecDeque<StreamId>,
    accept_bi_waker: Option<Waker>,

    pending_uni: VecDeque<StreamId>,
    accept_uni_waker: Option<Waker>,

    pending_confirms: VecDeque<StreamId>,
    open_waker: Option<Waker>,

    datagrams: VecDeque<Bytes>,
    datagram_waker: Option<Waker>,

    receipts: HashMap<u64, ReceiptSenders>,

    pub(crate) closed: bool,
    pub(crate) close_error: Option<(u64, String)>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            streams: HashMap::new(),
            pending_bi: VecDeque::new(),
            accept_bi_waker: None,
            pending_uni: VecDeque::new(),
            accept_uni_waker: None,
            pending_confirms: VecDeque::new(),
            open_waker: None,
            datagrams: VecDeque::new(),
            datagram_waker: None,
            receipts: HashMap::new(),
            closed: false,
            close_error: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Self {
        Self::new()
    }

    fn wake_all(&mut self) {
        for stream in self.streams.values_mut() {
            if let Some(waker) = stream.read_waker.take() {
                waker.wake();
            }
        }
        for waker in [
            self.accept_bi_waker.take(),
            self.accept_uni_waker.take(),
            self.open_waker.take(),
            self.datagram_waker.take(),
        ]
        .into_iter()
        .flatten()
        {
            waker.wake();
        }
    }
}

/// Handle to a single QUIC connection.
///
/// Cloning is intentionally not provided; the engine owns the handle and
/// hands out stream halves instead.
pub struct ConnectionHandle {
    conn_id: ConnectionId,
    egress: Sender<Command>,
    shared: Arc<Mutex<Shared>>,
    next_datagram_seq: AtomicU64,
}

impl ConnectionHandle {
    /// Build a handle over the connection's ingress/egress channels and
    /// spawn its event pump on the given runtime.
    pub fn new(
        conn_id: ConnectionId,
        mut ingress: mpsc::Receiver<Event>,
        egress: Sender<Command>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared::new()));

        let pump_shared = shared.clone();
        runtime.spawn(async move {
            while let Some(event) = ingress.recv().await {
                apply_event(&pump_shared, event);
            }
            // Worker dropped the channel: the connection is gone.
            let mut shared = pump_shared.lock();
            shared.closed = true;
            shared.wake_all();
        });

        ConnectionHandle {
            conn_id,
            egress,
            shared,
            next_datagram_seq: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Error code and reason from the peer's CONNECTION_CLOSE, if one arrived.
    pub fn close_reason(&self) -> Option<(u64, String)> {
        self.shared.lock().close_error.clone()
    }

    /// Open a locally initiated bidirectional stream.
    pub async fn open_bi_stream(&self) -> io::Result<BiStream> {
        self.send_command(Command::OpenBiStream {
            conn_id: self.conn_id,
        })?;
        let stream_id = self.await_confirm().await?;
        Ok(BiStream::new(
            SendStream::new(self.conn_id, stream_id, self.egress.clone(), self.shared.clone()),
            RecvStream::new(self.conn_id, stream_id, self.egress.clone(), self.shared.clone()),
        ))
    }

    /// Open a locally initiated unidirectional (send-only) stream.
    pub async fn open_uni_stream(&self) -> io::Result<SendStream> {
        self.send_command(Command::OpenUniStream {
            conn_id: self.conn_id,
        })?;
        let stream_id = self.await_confirm().await?;
        Ok(SendStream::new(
            self.conn_id,
            stream_id,
            self.egress.clone(),
            self.shared.clone(),
        ))
    }

    /// Accept the next peer-initiated bidirectional stream.
    pub async fn accept_bi_stream(&self) -> io::Result<BiStream> {
        let stream_id = PopFuture {
            shared: &self.shared,
            queue: QueueKind::AcceptBi,
        }
        .await?;
        Ok(BiStream::new(
            SendStream::new(self.conn_id, stream_id, self.egress.clone(), self.shared.clone()),
            RecvStream::new(self.conn_id, stream_id, self.egress.clone(), self.shared.clone()),
        ))
    }

    /// Accept the next peer-initiated unidirectional stream.
    pub async fn accept_uni_stream(&self) -> io::Result<RecvStream> {
        let stream_id = PopFuture {
            shared: &self.shared,
            queue: QueueKind::AcceptUni,
        }
        .await?;
        Ok(RecvStream::new(
            self.conn_id,
            stream_id,
            self.egress.clone(),
            self.shared.clone(),
        ))
    }

    /// Receive the next QUIC datagram.
    pub async fn recv_datagram(&self) -> io::Result<Bytes> {
        DatagramRecvFuture {
            shared: &self.shared,
        }
        .await
    }

    /// Send a QUIC datagram, returning a receipt whose futures resolve on
    /// acknowledgement or presumed loss.
    pub fn send_datagram(&self, data: Bytes, priority: u8) -> io::Result<DatagramSend> {
        let seq = self.next_datagram_seq.fetch_add(1, Ordering::Relaxed);
        let (acked_tx, acked_rx) = oneshot::channel();
        let (lost_tx, lost_rx) = oneshot::channel();
        self.shared.lock().receipts.insert(
            seq,
            ReceiptSenders {
                acked: acked_tx,
                lost: lost_tx,
            },
        );
        self.send_command(Command::SendDatagram {
            conn_id: self.conn_id,
            seq,
            data,
            priority,
        })?;
        Ok(DatagramSend::new(acked_rx, lost_rx))
    }

    /// Close the connection with an application error code.
    pub fn close(&self, error_code: u64, reason: impl Into<String>) -> io::Result<()> {
        self.send_command(Command::CloseConnection {
            conn_id: self.conn_id,
            error_code,
            reason: reason.into(),
        })
    }

    fn send_command(&self, command: Command) -> io::Result<()> {
        self.egress
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    async fn await_confirm(&self) -> io::Result<StreamId> {
        PopFuture {
            shared: &self.shared,
            queue: QueueKind::OpenConfirm,
        }
        .await
    }
}

/// Apply one ingress event to the shared state, waking any parked reader.
fn apply_event(shared: &Mutex<Shared>, event: Event) {
    let mut state = shared.lock();
    match event {
        Event::StreamOpened {
            stream_id,
            is_bidirectional,
        } => {
            trace!(%stream_id, is_bidirectional, "peer stream opened");
            if is_bidirectional {
                state.pending_bi.push_back(stream_id);
                if let Some(waker) = state.accept_bi_waker.take() {
                    waker.wake();
                }
            } else {
                state.pending_uni.push_back(stream_id);
                if let Some(waker) = state.accept_uni_waker.take() {
                    waker.wake();
                }
            }
        }
        Event::StreamOpenedConfirm { stream_id } => {
            state.pending_confirms.push_back(stream_id);
            if let Some(waker) = state.open_waker.take() {
                waker.wake();
            }
        }
        Event::StreamData {
            stream_id,
            data,
            fin,
        } => {
            let stream = state.streams.entry(stream_id).or_default();
            if !data.is_empty() {
                stream.chunks.push_back(data);
            }
            if fin {
                stream.fin_received = true;
            }
            if let Some(waker) = stream.read_waker.take() {
                waker.wake();
            }
        }
        Event::StreamReset {
            stream_id,
            error_code,
        } => {
            let stream = state.streams.entry(stream_id).or_default();
            stream.reset_error = Some(error_code);
            if let Some(waker) = stream.read_waker.take() {
                waker.wake();
            }
        }
        Event::StreamStopSending { .. } => {
            // Write-side aborts surface on the next write as BrokenPipe via
            // the worker; nothing to record here.
        }
        Event::DatagramReceived { data } => {
            state.datagrams.push_back(data);
            if let Some(waker) = state.datagram_waker.take() {
                waker.wake();
            }
        }
        Event::DatagramAcked { seq } => {
            if let Some(receipt) = state.receipts.remove(&seq) {
                receipt.resolve_acked();
            }
        }
        Event::DatagramLost { seq } => {
            if let Some(receipt) = state.receipts.remove(&seq) {
                receipt.resolve_lost();
            }
        }
        Event::ConnectionClosing { error_code, reason } => {
            state.closed = true;
            state.close_error = Some((error_code, reason));
            state.wake_all();
        }
        Event::ConnectionClosed => {
            state.closed = true;
            state.wake_all();
        }
    }
}

#[derive(Clone, Copy)]
enum QueueKind {
    AcceptBi,
    AcceptUni,
    OpenConfirm,
}

/// Waits for the next id on one of the connection-level stream queues.
struct PopFuture<'a> {
    shared: &'a Arc<Mutex<Shared>>,
    queue: QueueKind,
}

impl Future for PopFuture<'_> {
    type Output = io::Result<StreamId>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let (queue, waker_slot) = match self.queue {
            QueueKind::AcceptBi => (&mut state.pending_bi, &mut state.accept_bi_waker),
            QueueKind::AcceptUni => (&mut state.pending_uni, &mut state.accept_uni_waker),
            QueueKind::OpenConfirm => (&mut state.pending_confirms, &mut state.open_waker),
        };
        if let Some(stream_id) = queue.pop_front() {
            return Poll::Ready(Ok(stream_id));
        }
        if state.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )));
        }
        *waker_slot = Some(cx.waker().clone());
        Poll::Pending
    }
}

struct DatagramRecvFuture<'a> {
    shared: &'a Arc<Mutex<Shared>>,
}

impl Future for DatagramRecvFuture<'_> {
    type Output = io::Result<Bytes>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if let Some(data) = state.datagrams.pop_front() {
            return Poll::Ready(Ok(data));
        }
        if state.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )));
        }
        state.datagram_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn handle() -> (ConnectionHandle, mpsc::Sender<Event>, crossbeam_channel::Receiver<Command>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(64);
        let (egress_tx, egress_rx) = unbounded();
        let handle = ConnectionHandle::new(
            ConnectionId(1),
            ingress_rx,
            egress_tx,
            &tokio::runtime::Handle::current(),
        );
        (handle, ingress_tx, egress_rx)
    }

    #[tokio::test]
    async fn accepts_peer_streams_in_order() {
        let (handle, ingress, _egress) = handle();
        for id in [4u64, 8, 12] {
            ingress
                .send(Event::StreamOpened {
                    stream_id: StreamId(id),
                    is_bidirectional: true,
                })
                .await
                .unwrap();
        }
        for id in [4u64, 8, 12] {
            let stream = handle.accept_bi_stream().await.unwrap();
            assert_eq!(stream.stream_id(), StreamId(id));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_waits_for_confirm() {
        let (handle, ingress, egress) = handle();
        let opened = tokio::spawn(async move { handle.open_uni_stream().await });
        // The open command is issued immediately.
        let command = egress.recv().unwrap();
        assert!(matches!(command, Command::OpenUniStream { .. }));
        ingress
            .send(Event::StreamOpenedConfirm {
                stream_id: StreamId(3),
            })
            .await
            .unwrap();
        let stream = opened.await.unwrap().unwrap();
        assert_eq!(stream.stream_id(), StreamId(3));
    }

    #[tokio::test]
    async fn datagram_receipt_resolves() {
        let (handle, ingress, egress) = handle();
        let receipt = handle.send_datagram(Bytes::from_static(b"hi"), 0).unwrap();
        let seq = match egress.recv().unwrap() {
            Command::SendDatagram { seq, .. } => seq,
            other => panic!("unexpected command: {other:?}"),
        };
        ingress.send(Event::DatagramAcked { seq }).await.unwrap();
        receipt.acknowledged.await;
    }

    #[tokio::test]
    async fn close_event_fails_pending_accept() {
        let (handle, ingress, _egress) = handle();
        ingress.send(Event::ConnectionClosed).await.unwrap();
        // Give the pump a chance to run.
        tokio::task::yield_now().await;
        let err = handle.accept_uni_stream().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(handle.is_closed());
    }
}
