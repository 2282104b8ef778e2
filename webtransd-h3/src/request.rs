//! Parsed extended-CONNECT requests awaiting an application decision.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use webtransd_qpack::ConnectHeaders;
use webtransd_x::{BiStream, CancelSignal};

use crate::connection::ConnectionInner;
use crate::error::{Error, ErrorCode, Result};
use crate::frame;
use crate::session::{abort_peer_stream, PeerStream, Session};

/// A validated WebTransport CONNECT request.
///
/// Exactly one of [`accept`](Self::accept), [`reject`](Self::reject), or
/// drop decides the request; drop rejects. Later calls fail with "request
/// expired".
pub struct AcceptRequest {
    conn: Arc<ConnectionInner>,
    headers: ConnectHeaders,
    stream: Option<BiStream>,
}

impl AcceptRequest {
    pub(crate) fn new(
        conn: Arc<ConnectionInner>,
        headers: ConnectHeaders,
        stream: BiStream,
    ) -> AcceptRequest {
        AcceptRequest {
            conn,
            headers,
            stream: Some(stream),
        }
    }

    pub fn authority(&self) -> &str {
        &self.headers.authority
    }

    pub fn path(&self) -> &str {
        &self.headers.path
    }

    pub fn origin(&self) -> &str {
        &self.headers.origin
    }

    /// Negotiated draft version suffix (e.g. `"02"`).
    pub fn version(&self) -> &str {
        &self.headers.version
    }

    /// Accept the request: send the `200` response block echoing the draft
    /// version, and register the new session under the request stream's ID.
    pub async fn accept(&mut self, cancel: &CancelSignal) -> Result<Session> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| Error::invalid_operation("request expired"))?;

        let block = webtransd_qpack::encode_accept_block(&self.headers.version);
        let mut response = BytesMut::new();
        frame::write_frame_header(frame::FRAME_HEADERS, block.len() as u64, &mut response)?;
        response.extend_from_slice(&block);

        let result = tokio::select! {
            res = stream.send.write_all(&response) => res.map_err(Error::from),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        if let Err(err) = result {
            let code = if matches!(err, Error::Cancelled) {
                ErrorCode::RequestCancelled
            } else {
                ErrorCode::InternalError
            };
            stream.send.abort_write(code.to_code());
            stream.recv.abort_read(code.to_code());
            return Err(err);
        }

        debug!(
            stream_id = stream.stream_id().0,
            authority = %self.headers.authority,
            path = %self.headers.path,
            "CONNECT accepted"
        );
        Ok(Session::create(self.conn.clone(), stream))
    }

    /// Reject the request, aborting both stream sides with
    /// H3_REQUEST_REJECTED.
    pub fn reject(&mut self) -> Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::invalid_operation("request expired"))?;
        debug!(stream_id = stream.stream_id().0, "CONNECT rejected");
        abort_peer_stream(PeerStream::Bi(stream), ErrorCode::RequestRejected);
        Ok(())
    }
}

impl Drop for AcceptRequest {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            abort_peer_stream(PeerStream::Bi(stream), ErrorCode::RequestRejected);
        }
    }
}
