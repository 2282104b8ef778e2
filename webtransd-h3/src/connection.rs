//! Per-connection HTTP/3 + WebTransport engine.
//!
//! `serve` drives a connection end to end: exchange SETTINGS on the control
//! streams, then concurrently read the peer's control stream, classify every
//! peer-initiated stream, and route incoming datagrams, until the peer goes
//! away, a critical stream fails, or the caller cancels.
//!
//! Protocol violations on an individual stream abort that stream with the
//! appropriate application error code and leave the connection running;
//! only control-stream failures tear the connection down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, trace, warn};
use webtransd_x::{BiStream, CancelSignal, ConnectionHandle, RecvStream, SendStream};

use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::frame;
use crate::request::AcceptRequest;
use crate::session::{abort_peer_stream, PeerStream, SessionShared};
use crate::varint;

/// A HEADERS frame awaiting CONNECT parsing: the declared header block size
/// and the stream it arrived on.
pub(crate) struct PendingRequest {
    pub(crate) header_block_size: u64,
    pub(crate) stream: BiStream,
}

pub(crate) struct ConnectionInner {
    quic: ConnectionHandle,
    config: ConnectionConfig,
    sessions: RwLock<HashMap<u64, Arc<SessionShared>>>,
    requests_tx: Mutex<Option<mpsc::UnboundedSender<PendingRequest>>>,
    requests_rx: AsyncMutex<mpsc::UnboundedReceiver<PendingRequest>>,
    /// Server control stream, present once SETTINGS are written.
    control: AsyncMutex<Option<SendStream>>,
    /// Largest request-stream ID in the peer's GOAWAY; may only decrease.
    peer_goaway: AtomicU64,
    /// Our GOAWAY watermark; set once.
    local_goaway: AtomicU64,
    last_accepted: AtomicU64,
}

impl ConnectionInner {
    pub(crate) fn quic(&self) -> &ConnectionHandle {
        &self.quic
    }

    pub(crate) fn register_session(&self, id: u64, session: Arc<SessionShared>) {
        self.sessions.write().insert(id, session);
    }

    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    fn queue_request(
        &self,
        pending: PendingRequest,
    ) -> std::result::Result<(), PendingRequest> {
        let guard = self.requests_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(pending).map_err(|rejected| rejected.0),
            None => Err(pending),
        }
    }

    /// Route a session-bound stream by its claimed session ID.
    fn route_stream(&self, session_id: u64, stream: PeerStream) {
        let session = self.sessions.read().get(&session_id).cloned();
        match session {
            Some(session) => {
                if let Err(stream) = session.try_queue_stream(stream) {
                    debug!(session_id, "session gone; rejecting buffered stream");
                    abort_peer_stream(stream, ErrorCode::BufferedStreamRejected);
                }
            }
            None => {
                debug!(session_id, "stream references unknown session");
                abort_peer_stream(stream, ErrorCode::IdError);
            }
        }
    }

    /// Deliver a datagram to the session its quarter-ID prefix names, or
    /// silently drop it.
    fn route_datagram(&self, data: Bytes) {
        let Some((quarter_id, consumed)) = varint::decode(&data) else {
            trace!("datagram without a session prefix dropped");
            return;
        };
        let Some(session_id) = quarter_id.checked_mul(4) else {
            trace!("datagram with out-of-range session prefix dropped");
            return;
        };
        let session = self.sessions.read().get(&session_id).cloned();
        match session {
            Some(session) => session.deliver_datagram(data.slice(consumed..)),
            None => trace!(session_id, "datagram for unknown session dropped"),
        }
    }
}

/// A served HTTP/3 connection speaking WebTransport.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(quic: ConnectionHandle, config: ConnectionConfig) -> Connection {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Connection {
            inner: Arc::new(ConnectionInner {
                quic,
                config,
                sessions: RwLock::new(HashMap::new()),
                requests_tx: Mutex::new(Some(requests_tx)),
                requests_rx: AsyncMutex::new(requests_rx),
                control: AsyncMutex::new(None),
                peer_goaway: AtomicU64::new(u64::MAX),
                local_goaway: AtomicU64::new(u64::MAX),
                last_accepted: AtomicU64::new(0),
            }),
        }
    }

    /// Drive the connection until it ends, then tear it down: the QUIC
    /// connection is closed (H3_NO_ERROR when clean, H3_REQUEST_CANCELLED
    /// on cancellation, the specific protocol code otherwise), pending
    /// requests are drained and aborted, and live sessions are completed.
    pub async fn serve(&self, cancel: &CancelSignal) -> Result<()> {
        let result = self.run(cancel).await;
        let code = match &result {
            Ok(()) => ErrorCode::NoError,
            Err(Error::Cancelled) => ErrorCode::RequestCancelled,
            Err(Error::InvalidData { code, .. }) => *code,
            Err(_) => ErrorCode::ClosedCriticalStream,
        };
        match &result {
            Ok(()) => info!("connection finished"),
            Err(err) => info!(%err, %code, "connection failed"),
        }
        let _ = self.inner.quic.close(code.to_code(), "");
        self.shutdown(code).await;
        result
    }

    /// Next queued extended-CONNECT request. Streams whose header block
    /// fails to decode or validate are aborted with
    /// H3_GENERAL_PROTOCOL_ERROR and skipped; the connection survives.
    pub async fn accept_request(&self, cancel: &CancelSignal) -> Result<AcceptRequest> {
        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                pending = async {
                    self.inner.requests_rx.lock().await.recv().await
                } => pending.ok_or(Error::ConnectionClosed)?,
            };
            match self.read_connect(pending, cancel).await {
                Ok(request) => return Ok(request),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    debug!(%err, "rejecting malformed CONNECT request");
                }
            }
        }
    }

    /// Announce graceful shutdown: records the last accepted stream ID as
    /// the GOAWAY watermark (new streams above it are rejected with
    /// H3_REQUEST_REJECTED) and emits a GOAWAY frame. A second call fails.
    pub async fn goaway(&self) -> Result<()> {
        let inner = &self.inner;
        let last = inner.last_accepted.load(Ordering::SeqCst);
        inner
            .local_goaway
            .compare_exchange(u64::MAX, last, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::invalid_operation("GOAWAY already sent"))?;
        let mut guard = inner.control.lock().await;
        let control = guard
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("connection is not serving"))?;
        let goaway = frame::goaway_frame(last)?;
        control.write_all(&goaway).await.map_err(Error::from)?;
        info!(last_accepted = last, "GOAWAY sent");
        Ok(())
    }

    /// IDs of the sessions currently registered on this connection.
    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn run(&self, cancel: &CancelSignal) -> Result<()> {
        let inner = &self.inner;
        let peer_control = self.setup(cancel).await?;
        let mut control_task = tokio::spawn(control_loop(inner.clone(), peer_control));

        let result = loop {
            tokio::select! {
                accepted = inner.quic.accept_bi_stream() => match accepted {
                    Ok(stream) => admit_bi(inner, stream),
                    Err(err) => break Err(Error::from(err)),
                },
                accepted = inner.quic.accept_uni_stream() => match accepted {
                    Ok(stream) => admit_uni(inner, stream),
                    Err(err) => break Err(Error::from(err)),
                },
                datagram = inner.quic.recv_datagram() => match datagram {
                    Ok(data) => inner.route_datagram(data),
                    Err(err) => break Err(Error::from(err)),
                },
                control = &mut control_task => {
                    break match control {
                        Ok(result) => result.and(Err(Error::invalid_data(
                            ErrorCode::ClosedCriticalStream,
                            "control stream reader stopped",
                        ))),
                        Err(_) => Err(Error::invalid_data(
                            ErrorCode::ClosedCriticalStream,
                            "control stream reader panicked",
                        )),
                    };
                }
                _ = cancel.cancelled() => break Err(Error::Cancelled),
            }
        };
        control_task.abort();

        // The peer closing the connection is a clean end, not a failure.
        match result {
            Err(Error::Io(_)) if inner.quic.is_closed() => Ok(()),
            other => other,
        }
    }

    /// Exchange SETTINGS: accept and validate the peer's control stream,
    /// then open ours. No request is surfaced before this completes.
    async fn setup(&self, cancel: &CancelSignal) -> Result<RecvStream> {
        let inner = &self.inner;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                let mut control = inner.quic.accept_uni_stream().await.map_err(Error::from)?;
                let stream_type = varint::read(&mut control).await?;
                if stream_type != frame::STREAM_TYPE_CONTROL {
                    return Err(Error::invalid_data(
                        ErrorCode::StreamCreationError,
                        "first unidirectional stream is not a control stream",
                    ));
                }
                let (frame_type, len) = frame::read_frame_header(&mut control)
                    .await?
                    .ok_or_else(|| Error::invalid_data(
                        ErrorCode::MissingSettings,
                        "control stream ended before SETTINGS",
                    ))?;
                if frame_type != frame::FRAME_SETTINGS {
                    return Err(Error::invalid_data(
                        ErrorCode::MissingSettings,
                        "first control frame is not SETTINGS",
                    ));
                }
                if len > 16384 {
                    return Err(Error::invalid_data(
                        ErrorCode::FrameError,
                        "oversized SETTINGS frame",
                    ));
                }
                let mut payload = vec![0u8; len as usize];
                frame::read_exact(&mut control, &mut payload).await?;
                let pairs = frame::parse_settings(&payload)?;
                let value_of = |id| {
                    pairs
                        .iter()
                        .rev()
                        .find(|(setting, _)| *setting == id)
                        .map(|(_, value)| *value)
                };
                if value_of(frame::SETTINGS_H3_DATAGRAM) != Some(1)
                    || value_of(frame::SETTINGS_ENABLE_WEBTRANSPORT) != Some(1)
                {
                    return Err(Error::invalid_data(
                        ErrorCode::MissingSettings,
                        "peer did not advertise WebTransport with datagrams",
                    ));
                }
                debug!("peer SETTINGS accepted");

                let mut local = inner.quic.open_uni_stream().await.map_err(Error::from)?;
                local
                    .write_all(&frame::server_control_preamble())
                    .await
                    .map_err(Error::from)?;
                *inner.control.lock().await = Some(local);
                Ok(control)
            } => result,
        }
    }

    async fn read_connect(
        &self,
        mut pending: PendingRequest,
        cancel: &CancelSignal,
    ) -> Result<AcceptRequest> {
        let max = self.inner.config.max_field_section_size as u64;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                if pending.header_block_size > max {
                    return Err(Error::HeaderFieldTooLarge);
                }
                let mut block = vec![0u8; pending.header_block_size as usize];
                frame::read_exact(&mut pending.stream.recv, &mut block).await?;
                Ok(webtransd_qpack::decode_connect(&block)?)
            } => result,
        };
        match result {
            Ok(headers) => Ok(AcceptRequest::new(
                self.inner.clone(),
                headers,
                pending.stream,
            )),
            Err(err) => {
                let code = if matches!(err, Error::Cancelled) {
                    ErrorCode::RequestCancelled
                } else {
                    ErrorCode::GeneralProtocolError
                };
                pending.stream.recv.abort_read(code.to_code());
                pending.stream.send.abort_write(code.to_code());
                Err(err)
            }
        }
    }

    async fn shutdown(&self, code: ErrorCode) {
        let inner = &self.inner;
        *inner.requests_tx.lock() = None;
        let mut rx = inner.requests_rx.lock().await;
        rx.close();
        while let Ok(pending) = rx.try_recv() {
            abort_peer_stream(PeerStream::Bi(pending.stream), code);
        }
        drop(rx);

        let sessions: Vec<Arc<SessionShared>> =
            inner.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.complete().await;
        }
    }
}

/// Record the accepted stream, enforce the GOAWAY watermark, and hand the
/// stream to a short-lived classification task.
fn admit_bi(inner: &Arc<ConnectionInner>, stream: BiStream) {
    let id = stream.stream_id().0;
    inner.last_accepted.store(id, Ordering::SeqCst);
    if id > inner.local_goaway.load(Ordering::SeqCst) {
        debug!(stream_id = id, "stream past GOAWAY watermark rejected");
        abort_peer_stream(PeerStream::Bi(stream), ErrorCode::RequestRejected);
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move { classify_bi(inner, stream).await });
}

fn admit_uni(inner: &Arc<ConnectionInner>, stream: RecvStream) {
    let id = stream.stream_id().0;
    inner.last_accepted.store(id, Ordering::SeqCst);
    if id > inner.local_goaway.load(Ordering::SeqCst) {
        debug!(stream_id = id, "stream past GOAWAY watermark rejected");
        abort_peer_stream(PeerStream::Uni(stream), ErrorCode::RequestRejected);
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move { classify_uni(inner, stream).await });
}

/// First frame decides a bidirectional stream's fate: WEBTRANSPORT_STREAM
/// routes it to its session (the varint after the type is the session ID),
/// HEADERS queues a request, anything else is unexpected.
async fn classify_bi(inner: Arc<ConnectionInner>, mut stream: BiStream) {
    match frame::read_frame_header(&mut stream.recv).await {
        Ok(Some((frame::FRAME_WEBTRANSPORT_STREAM, session_id))) => {
            inner.route_stream(session_id, PeerStream::Bi(stream));
        }
        Ok(Some((frame::FRAME_HEADERS, header_block_size))) => {
            let pending = PendingRequest {
                header_block_size,
                stream,
            };
            if let Err(pending) = inner.queue_request(pending) {
                warn!("request queue unavailable; rejecting stream");
                abort_peer_stream(PeerStream::Bi(pending.stream), ErrorCode::ExcessiveLoad);
            }
        }
        Ok(Some((frame_type, _))) => {
            debug!(frame_type, "unexpected first frame on request stream");
            abort_peer_stream(PeerStream::Bi(stream), ErrorCode::FrameUnexpected);
        }
        Ok(None) => {
            trace!("peer stream closed before its first frame");
        }
        Err(err) => {
            debug!(%err, "failed reading first frame of peer stream");
            abort_peer_stream(PeerStream::Bi(stream), err.stream_error_code());
        }
    }
}

/// A unidirectional stream is either a session-bound WebTransport stream, a
/// reserved (grease) stream aborted with its own type as the code, or a
/// creation error.
async fn classify_uni(inner: Arc<ConnectionInner>, mut stream: RecvStream) {
    match varint::read_opt(&mut stream).await {
        Ok(Some(frame::STREAM_TYPE_WEBTRANSPORT)) => {
            match varint::read(&mut stream).await {
                Ok(session_id) => inner.route_stream(session_id, PeerStream::Uni(stream)),
                Err(err) => {
                    debug!(%err, "session stream without a session id");
                    stream.abort_read(err.stream_error_code().to_code());
                }
            }
        }
        Ok(Some(stream_type)) if frame::is_reserved_type(stream_type) => {
            trace!(stream_type, "reserved unidirectional stream");
            stream.abort_read(stream_type);
        }
        Ok(Some(stream_type)) => {
            debug!(stream_type, "unsupported unidirectional stream");
            stream.abort_read(ErrorCode::StreamCreationError.to_code());
        }
        Ok(None) => {
            trace!("peer stream closed before its type");
        }
        Err(err) => {
            debug!(%err, "failed reading unidirectional stream type");
            stream.abort_read(err.stream_error_code().to_code());
        }
    }
}

/// Drain the peer's control stream for the connection's lifetime,
/// processing GOAWAY and rejecting anything that must not appear there.
async fn control_loop(inner: Arc<ConnectionInner>, mut control: RecvStream) -> Result<()> {
    loop {
        let Some((frame_type, len)) = frame::read_frame_header(&mut control).await? else {
            return Err(Error::invalid_data(
                ErrorCode::ClosedCriticalStream,
                "peer closed its control stream",
            ));
        };
        match frame_type {
            frame::FRAME_GOAWAY => {
                if len == 0 || len > 8 {
                    return Err(Error::invalid_data(
                        ErrorCode::FrameError,
                        "malformed GOAWAY length",
                    ));
                }
                let mut payload = [0u8; 8];
                frame::read_exact(&mut control, &mut payload[..len as usize]).await?;
                let decoded = varint::decode(&payload[..len as usize]);
                let Some((id, used)) = decoded.filter(|(_, used)| *used as u64 == len) else {
                    return Err(Error::invalid_data(
                        ErrorCode::FrameError,
                        "malformed GOAWAY payload",
                    ));
                };
                let previous = inner.peer_goaway.load(Ordering::SeqCst);
                if id > previous {
                    return Err(Error::invalid_data(
                        ErrorCode::IdError,
                        "GOAWAY identifier increased",
                    ));
                }
                inner.peer_goaway.store(id, Ordering::SeqCst);
                info!(last_accepted = id, "peer sent GOAWAY");
            }
            frame::FRAME_SETTINGS => {
                return Err(Error::invalid_data(
                    ErrorCode::FrameUnexpected,
                    "duplicate SETTINGS frame",
                ));
            }
            other => {
                trace!(frame_type = other, len, "ignoring control frame");
                frame::drop_exact(&mut control, len).await?;
            }
        }
    }
}
