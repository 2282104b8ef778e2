//! HTTP/3 frame layer (RFC 9114 Section 7) plus the stream-type and
//! SETTINGS identifiers WebTransport relies on.
//!
//! Reserved "grease" frames, types of the form `0x1f * N + 0x21`
//! (RFC 9114 Section 7.2.8), are consumed transparently by the header
//! reader so callers only ever see meaningful frames.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ErrorCode, Result};
use crate::varint;

/// DATA frame, the carrier of capsules on request streams.
pub const FRAME_DATA: u64 = 0x00;
/// HEADERS frame carrying a QPACK-encoded field section.
pub const FRAME_HEADERS: u64 = 0x01;
/// SETTINGS frame, first frame on each control stream.
pub const FRAME_SETTINGS: u64 = 0x04;
/// GOAWAY frame carrying the last-accepted request stream ID.
pub const FRAME_GOAWAY: u64 = 0x07;
/// WEBTRANSPORT_STREAM marker opening a session-bound bidirectional
/// stream; the varint that follows is the session ID, not a length.
pub const FRAME_WEBTRANSPORT_STREAM: u64 = 0x41;

/// Unidirectional stream type of the HTTP/3 control stream.
pub const STREAM_TYPE_CONTROL: u64 = 0x00;
/// Unidirectional stream type of a session-bound WebTransport stream.
pub const STREAM_TYPE_WEBTRANSPORT: u64 = 0x54;

/// SETTINGS_H3_DATAGRAM (draft-ietf-masque-h3-datagram-03).
pub const SETTINGS_H3_DATAGRAM: u64 = 0xffd277;
/// SETTINGS_ENABLE_WEBTRANSPORT (draft-ietf-webtrans-http3-02).
pub const SETTINGS_ENABLE_WEBTRANSPORT: u64 = 0x2b603742;

/// Reserved frame and stream types: `0x1f * N + 0x21`.
pub fn is_reserved_type(value: u64) -> bool {
    value >= 0x21 && (value - 0x21) % 0x1f == 0
}

/// Read the next `(type, length)` frame header, transparently draining any
/// reserved frames in front of it. Returns `None` when the stream ends
/// cleanly at a frame boundary.
///
/// Truncation inside a skipped reserved payload surfaces as
/// [`Error::UnexpectedEof`]; the caller aborts the write side with
/// [`ErrorCode::FrameError`] (its `stream_error_code`).
pub async fn read_frame_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u64, u64)>> {
    loop {
        let Some(frame_type) = varint::read_opt(reader).await? else {
            return Ok(None);
        };
        let length = varint::read(reader).await?;
        if is_reserved_type(frame_type) {
            drop_exact(reader, length).await?;
            continue;
        }
        return Ok(Some((frame_type, length)));
    }
}

/// Append a `(type, length)` frame header.
pub fn write_frame_header(frame_type: u64, length: u64, out: &mut BytesMut) -> Result<()> {
    varint::encode(frame_type, out)?;
    varint::encode(length, out)?;
    Ok(())
}

/// Fill `buf` from the stream; a premature half-close fails with
/// [`Error::UnexpectedEof`].
pub async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await?;
    Ok(())
}

/// Read and discard exactly `n` bytes.
pub async fn drop_exact<R: AsyncRead + Unpin>(reader: &mut R, mut n: u64) -> Result<()> {
    let mut scratch = [0u8; 512];
    while n > 0 {
        let take = scratch.len().min(n as usize);
        reader.read_exact(&mut scratch[..take]).await?;
        n -= take as u64;
    }
    Ok(())
}

/// The body a server writes when opening its control stream: stream type 0
/// followed by a SETTINGS frame advertising H3 datagrams and WebTransport.
pub fn server_control_preamble() -> BytesMut {
    let mut payload = BytesMut::new();
    for (id, value) in [
        (SETTINGS_H3_DATAGRAM, 1u64),
        (SETTINGS_ENABLE_WEBTRANSPORT, 1),
    ] {
        varint::encode(id, &mut payload).expect("setting id in range");
        varint::encode(value, &mut payload).expect("setting value in range");
    }
    let mut out = BytesMut::new();
    varint::encode(STREAM_TYPE_CONTROL, &mut out).expect("stream type in range");
    write_frame_header(FRAME_SETTINGS, payload.len() as u64, &mut out)
        .expect("frame header in range");
    out.extend_from_slice(&payload);
    out
}

/// Encode a GOAWAY frame carrying the last-accepted stream ID.
pub fn goaway_frame(last_accepted: u64) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    write_frame_header(FRAME_GOAWAY, varint::size(last_accepted) as u64, &mut out)?;
    varint::encode(last_accepted, &mut out)?;
    Ok(out)
}

/// Parse a SETTINGS payload into `(id, value)` pairs.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let Some((id, used)) = varint::decode(&payload[pos..]) else {
            return Err(Error::invalid_data(
                ErrorCode::FrameError,
                "truncated setting id",
            ));
        };
        pos += used;
        let Some((value, used)) = varint::decode(&payload[pos..]) else {
            return Err(Error::invalid_data(
                ErrorCode::FrameError,
                "truncated setting value",
            ));
        };
        pos += used;
        pairs.push((id, value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_type_rule() {
        assert!(is_reserved_type(0x21));
        assert!(is_reserved_type(0x21 + 0x1f));
        assert!(is_reserved_type(0x21 + 0x1f * 7));
        assert!(!is_reserved_type(FRAME_DATA));
        assert!(!is_reserved_type(FRAME_HEADERS));
        assert!(!is_reserved_type(FRAME_WEBTRANSPORT_STREAM));
        assert!(!is_reserved_type(STREAM_TYPE_WEBTRANSPORT));
        assert!(!is_reserved_type(0x22));
    }

    #[tokio::test]
    async fn reads_header_and_skips_grease() {
        let mut data = BytesMut::new();
        // Reserved frame 0x40 (0x21 + 0x1f) with a 5-byte payload, then
        // HEADERS with length 7.
        write_frame_header(0x40, 5, &mut data).unwrap();
        data.extend_from_slice(&[0xaa; 5]);
        write_frame_header(FRAME_HEADERS, 7, &mut data).unwrap();
        let mut reader = &data[..];
        assert_eq!(
            read_frame_header(&mut reader).await.unwrap(),
            Some((FRAME_HEADERS, 7))
        );
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let mut reader: &[u8] = &[];
        assert_eq!(read_frame_header(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_grease_payload_is_eof() {
        let mut data = BytesMut::new();
        write_frame_header(0x40, 5, &mut data).unwrap();
        data.extend_from_slice(&[0xaa; 2]);
        let mut reader = &data[..];
        let err = read_frame_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
        assert_eq!(err.stream_error_code(), ErrorCode::FrameError);
    }

    #[test]
    fn server_preamble_is_byte_exact() {
        assert_eq!(
            &server_control_preamble()[..],
            &[
                0x00, 0x04, 0x0a, 0x80, 0xff, 0xd2, 0x77, 0x01, 0xab, 0x60, 0x37, 0x42,
                0x01
            ]
        );
    }

    #[test]
    fn goaway_frame_layout() {
        let frame = goaway_frame(4).unwrap();
        assert_eq!(&frame[..], &[0x07, 0x01, 0x04]);
    }

    #[test]
    fn settings_roundtrip() {
        let preamble = server_control_preamble();
        // Skip stream type + frame header (type 0x04, len 0x0a).
        let pairs = parse_settings(&preamble[3..]).unwrap();
        assert_eq!(
            pairs,
            vec![(SETTINGS_H3_DATAGRAM, 1), (SETTINGS_ENABLE_WEBTRANSPORT, 1)]
        );
    }

    #[test]
    fn truncated_settings_rejected() {
        let payload = [0x80, 0xff, 0xd2, 0x77]; // id without value
        assert!(matches!(
            parse_settings(&payload),
            Err(Error::InvalidData {
                code: ErrorCode::FrameError,
                ..
            })
        ));
    }
}
