//! WebTransport session lifecycle.
//!
//! A session is born when an extended-CONNECT request is accepted; its
//! stream ID becomes the session ID. The connection's classifier feeds
//! peer-opened streams into the session's accept queue and delivers
//! datagrams to its registered sink; a dedicated reader task consumes
//! capsules off the CONNECT request stream until the peer finishes or
//! closes the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};
use webtransd_x::{BiStream, CancelSignal, DatagramSend, RecvStream, SendStream};

use crate::capsule::{
    self, CAPSULE_CLOSE_DATAGRAM_CONTEXT, CAPSULE_CLOSE_SESSION, CAPSULE_DATAGRAM_WITH_CONTEXT,
    CAPSULE_REGISTER_DATAGRAM_CONTEXT, CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT,
    CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT_CLIENT, MAX_CLOSE_CAPSULE_LEN, WEBTRANSPORT_DATAGRAM,
};
use crate::connection::ConnectionInner;
use crate::error::{Error, ErrorCode, Result};
use crate::frame;
use crate::varint;

/// A stream the peer opened into a session.
pub enum PeerStream {
    Bi(BiStream),
    Uni(RecvStream),
}

/// Terminal close received from the peer via CLOSE_WEBTRANSPORT_SESSION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClose {
    pub code: u32,
    pub message: String,
}

/// Abort every side of a peer stream with one application error code.
pub(crate) fn abort_peer_stream(stream: PeerStream, code: ErrorCode) {
    match stream {
        PeerStream::Uni(mut recv) => recv.abort_read(code.to_code()),
        PeerStream::Bi(mut stream) => {
            stream.recv.abort_read(code.to_code());
            stream.send.abort_write(code.to_code());
        }
    }
}

/// State shared between the session handle, the connection's classifier,
/// and the request-stream reader task.
pub(crate) struct SessionShared {
    id: u64,
    /// Producer side of the accept queue; taken on completion so late
    /// streams are rejected.
    queue_tx: Mutex<Option<mpsc::UnboundedSender<PeerStream>>>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerStream>>,
    /// Write half of the CONNECT request stream, used by `close` and by the
    /// reader's error path.
    send: AsyncMutex<Option<SendStream>>,
    datagram_registered: AtomicBool,
    datagram_sink: Mutex<Option<Box<dyn Fn(Bytes) + Send + Sync>>>,
    close_info: Mutex<Option<SessionClose>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl SessionShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand a peer-opened stream to the session. Returns the stream back
    /// when the accept queue has already closed.
    pub(crate) fn try_queue_stream(
        &self,
        stream: PeerStream,
    ) -> std::result::Result<(), PeerStream> {
        let guard = self.queue_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(stream).map_err(|rejected| rejected.0),
            None => Err(stream),
        }
    }

    /// Deliver a datagram payload (session-ID prefix already stripped).
    /// Invoked synchronously from the connection's datagram task; the sink
    /// must not block.
    pub(crate) fn deliver_datagram(&self, payload: Bytes) {
        let sink = self.datagram_sink.lock();
        match sink.as_ref() {
            Some(sink) => sink(payload),
            None => trace!(session_id = self.id, "datagram dropped: no sink registered"),
        }
    }

    /// Resolve the completion future, close the accept queue and abort any
    /// queued but undelivered streams. Idempotent.
    pub(crate) async fn complete(&self) {
        *self.queue_tx.lock() = None;
        let _ = self.done_tx.send(true);
        let mut rx = self.queue_rx.lock().await;
        rx.close();
        while let Ok(stream) = rx.try_recv() {
            abort_peer_stream(stream, ErrorCode::BufferedStreamRejected);
        }
    }
}

/// Handle to a live WebTransport session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    conn: Arc<ConnectionInner>,
    shared: Arc<SessionShared>,
}

impl Session {
    /// Register a new session for an accepted CONNECT stream and start its
    /// request-stream reader. The session is visible in the connection's
    /// map before this returns.
    pub(crate) fn create(conn: Arc<ConnectionInner>, stream: BiStream) -> Session {
        let (send, recv) = stream.split();
        let id = recv.stream_id().0;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            id,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: AsyncMutex::new(queue_rx),
            send: AsyncMutex::new(Some(send)),
            datagram_registered: AtomicBool::new(false),
            datagram_sink: Mutex::new(None),
            close_info: Mutex::new(None),
            done_tx,
            done_rx,
        });
        conn.register_session(id, shared.clone());
        tokio::spawn(session_reader(conn.clone(), shared.clone(), recv));
        debug!(session_id = id, "session established");
        Session { conn, shared }
    }

    /// The CONNECT request stream's ID.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the peer has registered the context-free datagram format.
    pub fn datagram_registered(&self) -> bool {
        self.shared.datagram_registered.load(Ordering::SeqCst)
    }

    /// Pull the next peer-opened stream, in the order the QUIC layer
    /// accepted them. Fails with [`Error::SessionClosed`] once the request
    /// stream has completed.
    pub async fn accept_stream(&self, cancel: &CancelSignal) -> Result<PeerStream> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            stream = async {
                let mut rx = self.shared.queue_rx.lock().await;
                rx.recv().await
            } => stream.ok_or(Error::SessionClosed),
        }
    }

    /// Open a unidirectional stream bound to this session. The stream-type
    /// and session-ID preamble is written before the stream is returned.
    pub async fn open_unidirectional_stream(&self, cancel: &CancelSignal) -> Result<SendStream> {
        let mut stream = self
            .conn
            .quic()
            .open_uni_stream()
            .await
            .map_err(Error::from)?;
        let mut preamble = BytesMut::new();
        varint::encode(frame::STREAM_TYPE_WEBTRANSPORT, &mut preamble)?;
        varint::encode(self.shared.id, &mut preamble)?;
        let result = tokio::select! {
            res = stream.write_all(&preamble) => res.map_err(Error::from),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        match result {
            Ok(()) => Ok(stream),
            Err(err) => {
                stream.abort_write(write_failure_code(&err).to_code());
                Err(err)
            }
        }
    }

    /// Open a bidirectional stream bound to this session.
    pub async fn open_bidirectional_stream(&self, cancel: &CancelSignal) -> Result<BiStream> {
        let mut stream = self
            .conn
            .quic()
            .open_bi_stream()
            .await
            .map_err(Error::from)?;
        let mut preamble = BytesMut::new();
        varint::encode(frame::FRAME_WEBTRANSPORT_STREAM, &mut preamble)?;
        varint::encode(self.shared.id, &mut preamble)?;
        let result = tokio::select! {
            res = stream.send.write_all(&preamble) => res.map_err(Error::from),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        match result {
            Ok(()) => Ok(stream),
            Err(err) => {
                let code = write_failure_code(&err).to_code();
                stream.send.abort_write(code);
                stream.recv.abort_read(code);
                Err(err)
            }
        }
    }

    /// Send a datagram to the peer, prefixed with the session's quarter-ID.
    ///
    /// Requires the peer to have registered datagrams first.
    pub fn send_datagram(&self, data: Bytes, priority: u8) -> Result<DatagramSend> {
        if !self.datagram_registered() {
            return Err(Error::invalid_operation(
                "peer has not registered for datagrams",
            ));
        }
        let mut buf = BytesMut::with_capacity(8 + data.len());
        varint::encode(self.shared.id / 4, &mut buf)?;
        buf.extend_from_slice(&data);
        self.conn
            .quic()
            .send_datagram(buf.freeze(), priority)
            .map_err(Error::from)
    }

    /// Register the sink receiving this session's datagrams. The sink is
    /// invoked synchronously from the connection's datagram task and must
    /// not block. Replaces any previous sink.
    pub fn set_datagram_sink(&self, sink: impl Fn(Bytes) + Send + Sync + 'static) {
        *self.shared.datagram_sink.lock() = Some(Box::new(sink));
    }

    /// Close the session: a bare FIN for `(0, None)`, otherwise a
    /// CLOSE_WEBTRANSPORT_SESSION capsule followed by FIN. Messages longer
    /// than 1024 bytes are refused.
    pub async fn close(
        &self,
        code: u32,
        message: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let capsule = match (code, message) {
            (0, None) => None,
            (code, message) => Some(capsule::encode_close_capsule(
                code,
                message.unwrap_or(""),
            )?),
        };
        let mut guard = self.shared.send.lock().await;
        let mut send = guard
            .take()
            .ok_or_else(|| Error::invalid_operation("session already closed"))?;
        let result = tokio::select! {
            res = write_close(&mut send, capsule.as_deref()) => res,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                send.abort_write(write_failure_code(&err).to_code());
                Err(err)
            }
        }
    }

    /// Wait for the session to end. Yields the peer's close information
    /// when it sent CLOSE_WEBTRANSPORT_SESSION, `None` for a plain FIN or
    /// a protocol failure.
    pub async fn closed(&self) -> Option<SessionClose> {
        let mut rx = self.shared.done_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.shared.close_info.lock().clone()
    }
}

fn write_failure_code(err: &Error) -> ErrorCode {
    if matches!(err, Error::Cancelled) {
        ErrorCode::RequestCancelled
    } else {
        ErrorCode::InternalError
    }
}

async fn write_close(send: &mut SendStream, capsule: Option<&[u8]>) -> Result<()> {
    if let Some(capsule) = capsule {
        send.write_all(capsule).await?;
    }
    send.shutdown().await?;
    Ok(())
}

/// Reader task for the CONNECT request stream: consumes capsules until the
/// peer finishes, closes, or misbehaves, then resolves the session's
/// completion.
async fn session_reader(
    conn: Arc<ConnectionInner>,
    shared: Arc<SessionShared>,
    mut recv: RecvStream,
) {
    match capsule_loop(&shared, &mut recv).await {
        Ok(Some(close)) => {
            debug!(
                session_id = shared.id,
                code = close.code,
                "peer closed session"
            );
            *shared.close_info.lock() = Some(close);
        }
        Ok(None) => {
            debug!(session_id = shared.id, "request stream finished");
        }
        Err(err) => {
            warn!(session_id = shared.id, %err, "request stream failed");
            recv.abort_read(err.stream_error_code().to_code());
            if let Some(send) = shared.send.lock().await.as_mut() {
                send.abort_write(ErrorCode::GeneralProtocolError.to_code());
            }
        }
    }
    conn.remove_session(shared.id);
    shared.complete().await;
}

async fn capsule_loop(
    shared: &SessionShared,
    recv: &mut RecvStream,
) -> Result<Option<SessionClose>> {
    loop {
        let Some((capsule_type, len)) = capsule::read_capsule_header(recv).await? else {
            return Ok(None);
        };
        match capsule_type {
            CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT => {
                if len != varint::size(WEBTRANSPORT_DATAGRAM) as u64 {
                    return Err(Error::NotSupported(
                        "unknown datagram registration format".to_owned(),
                    ));
                }
                let mut payload = [0u8; 4];
                frame::read_exact(recv, &mut payload).await?;
                match varint::decode(&payload) {
                    Some((WEBTRANSPORT_DATAGRAM, 4)) => {
                        shared.datagram_registered.store(true, Ordering::SeqCst);
                        debug!(session_id = shared.id, "datagrams registered");
                    }
                    _ => {
                        return Err(Error::NotSupported(
                            "unknown datagram registration format".to_owned(),
                        ))
                    }
                }
            }
            CAPSULE_CLOSE_SESSION => {
                if len > MAX_CLOSE_CAPSULE_LEN {
                    return Err(Error::invalid_data(
                        ErrorCode::MessageError,
                        "close capsule too large",
                    ));
                }
                let mut payload = vec![0u8; len as usize];
                frame::read_exact(recv, &mut payload).await?;
                let (code, message) = capsule::decode_close_payload(&payload)?;
                // The capsule must be the last thing on the stream.
                let mut probe = [0u8; 1];
                if recv.read(&mut probe).await? != 0 {
                    return Err(Error::invalid_operation(
                        "data after CLOSE_WEBTRANSPORT_SESSION",
                    ));
                }
                return Ok(Some(SessionClose { code, message }));
            }
            CAPSULE_REGISTER_DATAGRAM_CONTEXT
            | CAPSULE_CLOSE_DATAGRAM_CONTEXT
            | CAPSULE_DATAGRAM_WITH_CONTEXT
            | CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT_CLIENT => {
                return Err(Error::invalid_operation("unexpected capsule type"));
            }
            other => {
                trace!(session_id = shared.id, capsule = other, "ignoring capsule");
                frame::drop_exact(recv, len).await?;
            }
        }
    }
}
