//! Capsule protocol over HTTP/3 DATA frames (draft-ietf-webtrans-http3-02).
//!
//! Each DATA frame on the CONNECT request stream carries exactly one
//! capsule: `type varint, length varint, payload`. Reserved capsule types
//! of the form `41 * N + 23` are drained like grease frames.

use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{self, FRAME_DATA};
use crate::varint;

/// REGISTER_DATAGRAM_NO_CONTEXT: peer opts into context-free datagrams.
pub const CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT: u64 = 0xff37a2;
/// CLOSE_WEBTRANSPORT_SESSION: 32-bit error code plus UTF-8 message.
pub const CAPSULE_CLOSE_SESSION: u64 = 0x2843;
/// The datagram format code REGISTER_DATAGRAM_NO_CONTEXT must carry.
pub const WEBTRANSPORT_DATAGRAM: u64 = 0xff7c00;

/// The draft's context-ful datagram capsules; this server speaks only the
/// no-context variant and rejects these.
pub const CAPSULE_REGISTER_DATAGRAM_CONTEXT: u64 = 0xff37a1;
pub const CAPSULE_CLOSE_DATAGRAM_CONTEXT: u64 = 0xff37a3;
pub const CAPSULE_DATAGRAM_WITH_CONTEXT: u64 = 0xff37a4;
pub const CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT_CLIENT: u64 = 0xff37a5;

/// Largest CLOSE_WEBTRANSPORT_SESSION capsule: 4-byte code plus a message
/// of at most 1024 bytes.
pub const MAX_CLOSE_CAPSULE_LEN: u64 = 1028;
/// Largest close message in bytes.
pub const MAX_CLOSE_MESSAGE_LEN: usize = 1024;

/// Reserved capsule types: `41 * N + 23`.
pub fn is_reserved_capsule(value: u64) -> bool {
    value >= 23 && (value - 23) % 41 == 0
}

/// Read the next capsule header off the request stream.
///
/// Returns `None` on a clean FIN at a frame boundary. Enforces the
/// one-capsule-per-frame rule: the DATA frame's length must equal the
/// encoded capsule header plus its payload. Reserved capsules are drained
/// here and never surfaced.
pub async fn read_capsule_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u64, u64)>> {
    loop {
        let Some((frame_type, frame_len)) = frame::read_frame_header(reader).await? else {
            return Ok(None);
        };
        if frame_type != FRAME_DATA {
            return Err(Error::invalid_data(
                ErrorCode::FrameUnexpected,
                format!("frame type {frame_type:#x} on a capsule stream"),
            ));
        }
        let capsule_type = varint::read(reader).await?;
        let capsule_len = varint::read(reader).await?;
        let header_len = (varint::size(capsule_type) + varint::size(capsule_len)) as u64;
        if frame_len != header_len + capsule_len {
            return Err(Error::invalid_data(
                ErrorCode::GeneralProtocolError,
                "DATA frame length does not match its capsule",
            ));
        }
        if is_reserved_capsule(capsule_type) {
            frame::drop_exact(reader, capsule_len).await?;
            continue;
        }
        return Ok(Some((capsule_type, capsule_len)));
    }
}

/// Encode a CLOSE_WEBTRANSPORT_SESSION capsule inside its DATA frame.
pub fn encode_close_capsule(code: u32, message: &str) -> Result<BytesMut> {
    if message.len() > MAX_CLOSE_MESSAGE_LEN {
        return Err(Error::InvalidArgument(format!(
            "close message is {} bytes, limit is {MAX_CLOSE_MESSAGE_LEN}",
            message.len()
        )));
    }
    let capsule_len = 4 + message.len() as u64;
    let header_len = (varint::size(CAPSULE_CLOSE_SESSION) + varint::size(capsule_len)) as u64;

    let mut out = BytesMut::new();
    frame::write_frame_header(FRAME_DATA, header_len + capsule_len, &mut out)?;
    varint::encode(CAPSULE_CLOSE_SESSION, &mut out)?;
    varint::encode(capsule_len, &mut out)?;
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    Ok(out)
}

/// Decode a CLOSE_WEBTRANSPORT_SESSION payload that was read in full.
pub fn decode_close_payload(payload: &[u8]) -> Result<(u32, String)> {
    if payload.len() < 4 {
        return Err(Error::invalid_data(
            ErrorCode::MessageError,
            "close capsule shorter than its error code",
        ));
    }
    let code = u32::from_be_bytes(payload[..4].try_into().expect("checked length"));
    let message = std::str::from_utf8(&payload[4..])
        .map_err(|_| {
            Error::invalid_data(
                ErrorCode::GeneralProtocolError,
                "close message is not valid UTF-8",
            )
        })?
        .to_owned();
    Ok((code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[test]
    fn reserved_capsule_rule() {
        assert!(is_reserved_capsule(23));
        assert!(is_reserved_capsule(23 + 41));
        assert!(is_reserved_capsule(23 + 41 * 100));
        assert!(!is_reserved_capsule(CAPSULE_CLOSE_SESSION));
        assert!(!is_reserved_capsule(CAPSULE_REGISTER_DATAGRAM_NO_CONTEXT));
    }

    #[tokio::test]
    async fn close_capsule_roundtrip() {
        let encoded = encode_close_capsule(42, "going away").unwrap();
        let mut reader = &encoded[..];
        let (capsule_type, len) = read_capsule_header(&mut reader)
            .await
            .unwrap()
            .expect("capsule present");
        assert_eq!(capsule_type, CAPSULE_CLOSE_SESSION);
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(decode_close_payload(&payload).unwrap(), (42, "going away".to_owned()));
    }

    #[tokio::test]
    async fn non_data_frame_rejected() {
        let mut data = BytesMut::new();
        frame::write_frame_header(frame::FRAME_HEADERS, 3, &mut data).unwrap();
        let mut reader = &data[..];
        assert!(matches!(
            read_capsule_header(&mut reader).await,
            Err(Error::InvalidData {
                code: ErrorCode::FrameUnexpected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn length_mismatch_rejected() {
        let mut data = BytesMut::new();
        // DATA frame claims 20 bytes but the capsule accounts for fewer.
        frame::write_frame_header(FRAME_DATA, 20, &mut data).unwrap();
        varint::encode(CAPSULE_CLOSE_SESSION, &mut data).unwrap();
        varint::encode(4, &mut data).unwrap();
        data.extend_from_slice(&[0u8; 14]);
        let mut reader = &data[..];
        assert!(matches!(
            read_capsule_header(&mut reader).await,
            Err(Error::InvalidData {
                code: ErrorCode::GeneralProtocolError,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn reserved_capsule_skipped() {
        let mut data = BytesMut::new();
        // Reserved capsule 23 with 3 payload bytes, sized exactly.
        let header = (varint::size(23) + varint::size(3)) as u64;
        frame::write_frame_header(FRAME_DATA, header + 3, &mut data).unwrap();
        varint::encode(23, &mut data).unwrap();
        varint::encode(3, &mut data).unwrap();
        data.extend_from_slice(&[1, 2, 3]);
        data.extend_from_slice(&encode_close_capsule(0, "").unwrap());
        let mut reader = &data[..];
        let (capsule_type, len) = read_capsule_header(&mut reader)
            .await
            .unwrap()
            .expect("capsule present");
        assert_eq!(capsule_type, CAPSULE_CLOSE_SESSION);
        assert_eq!(len, 4);
    }

    #[test]
    fn oversized_close_message_rejected() {
        let message = "x".repeat(MAX_CLOSE_MESSAGE_LEN + 1);
        assert!(matches!(
            encode_close_capsule(0, &message),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn close_payload_too_short_rejected() {
        assert!(matches!(
            decode_close_payload(&[0, 0]),
            Err(Error::InvalidData {
                code: ErrorCode::MessageError,
                ..
            })
        ));
    }
}
