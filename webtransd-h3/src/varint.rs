//! QUIC variable-length integers (RFC 9000 Section 16).
//!
//! The top two bits of the first byte select a 1, 2, 4, or 8 byte encoding;
//! the remaining bits hold the value big-endian. Writers always emit the
//! shortest form; readers accept any length the value fits in.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Largest encodable value, 2^62 - 1.
pub const MAX: u64 = (1u64 << 62) - 1;

/// Decode from a borrowed buffer without consuming it.
///
/// Returns `(value, bytes_used)`, or `None` when the buffer is too short to
/// hold the complete integer.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = match first >> 6 {
        0b00 => 1,
        0b01 => 2,
        0b10 => 4,
        _ => 8,
    };
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for &byte in &buf[1..len] {
        value = value << 8 | u64::from(byte);
    }
    Some((value, len))
}

/// Number of bytes [`encode`] uses for `value`.
pub fn size(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append the shortest encoding of `value`, returning the bytes written.
///
/// Values above [`MAX`] fail with [`Error::OutOfRange`].
pub fn encode(value: u64, out: &mut impl BufMut) -> Result<usize> {
    if value > MAX {
        return Err(Error::OutOfRange);
    }
    match size(value) {
        1 => out.put_u8(value as u8),
        2 => out.put_u16(value as u16 | 0x4000),
        4 => out.put_u32(value as u32 | 0x8000_0000),
        _ => out.put_u64(value | 0xc000_0000_0000_0000),
    }
    Ok(size(value))
}

/// Read one integer from a stream; truncation fails with
/// [`Error::UnexpectedEof`].
pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    match read_opt(reader).await? {
        Some(value) => Ok(value),
        None => Err(Error::UnexpectedEof),
    }
}

/// Read one integer, or `None` when the stream ends cleanly before its
/// first byte. Truncation after the first byte is still an error.
pub async fn read_opt<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let len = match first[0] >> 6 {
        0b00 => 1usize,
        0b01 => 2,
        0b10 => 4,
        _ => 8,
    };
    let mut rest = [0u8; 7];
    reader.read_exact(&mut rest[..len - 1]).await?;
    let mut value = u64::from(first[0] & 0x3f);
    for &byte in &rest[..len - 1] {
        value = value << 8 | u64::from(byte);
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn rfc9000_appendix_a_examples() {
        assert_eq!(decode(&[0x25]), Some((37, 1)));
        assert_eq!(decode(&[0x7b, 0xbd]), Some((15293, 2)));
        assert_eq!(decode(&[0x9d, 0x7f, 0x3e, 0x7d]), Some((494_878_333, 4)));
        assert_eq!(
            decode(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]),
            Some((151_288_809_941_952_652, 8))
        );
        // Non-canonical two-byte encoding of 37 is accepted.
        assert_eq!(decode(&[0x40, 0x25]), Some((37, 2)));
    }

    #[test]
    fn short_buffers_peek_as_none() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x40]), None);
        assert_eq!(decode(&[0x9d, 0x7f]), None);
        assert_eq!(decode(&[0xc2, 0x19, 0x7c]), None);
    }

    #[test]
    fn writes_shortest_form() {
        for (value, expected_len) in [
            (0u64, 1usize),
            (63, 1),
            (64, 2),
            (16383, 2),
            (16384, 4),
            ((1 << 30) - 1, 4),
            (1 << 30, 8),
            (MAX, 8),
        ] {
            let mut buf = BytesMut::new();
            let written = encode(value, &mut buf).unwrap();
            assert_eq!(written, expected_len);
            assert_eq!(buf.len(), expected_len);
            assert_eq!(size(value), expected_len);
            assert_eq!(decode(&buf), Some((value, expected_len)));
        }
    }

    #[test]
    fn oversized_value_rejected() {
        let mut buf = BytesMut::new();
        assert!(matches!(encode(MAX + 1, &mut buf), Err(Error::OutOfRange)));
        assert!(matches!(encode(u64::MAX, &mut buf), Err(Error::OutOfRange)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn streaming_reader_roundtrip() {
        let mut buf = BytesMut::new();
        for value in [0u64, 63, 64, 16384, 1 << 31, MAX] {
            encode(value, &mut buf).unwrap();
        }
        let mut reader = &buf[..];
        for expected in [0u64, 63, 64, 16384, 1 << 31, MAX] {
            assert_eq!(read(&mut reader).await.unwrap(), expected);
        }
        assert_eq!(read_opt(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn streaming_reader_truncation() {
        let mut reader: &[u8] = &[0x9d, 0x7f];
        assert!(matches!(
            read(&mut reader).await,
            Err(Error::UnexpectedEof)
        ));
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read(&mut reader).await,
            Err(Error::UnexpectedEof)
        ));
    }
}
