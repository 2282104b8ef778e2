//! Response header block encoder for accepted CONNECT requests.

use crate::prefix_int;
use crate::static_table;

/// Encode the `200` response block for an accepted WebTransport CONNECT:
/// a zeroed field-section prefix, the indexed static `:status: 200`, and a
/// literal `sec-webtransport-http3-draft<suffix>: 1` echoing the negotiated
/// draft version. No Huffman coding is applied.
pub fn encode_accept_block(version_suffix: &str) -> Vec<u8> {
    let mut out = vec![0x00, 0x00];

    // Indexed field line, static table: 11xxxxxx.
    prefix_int::encode(static_table::STATUS_200, 6, 0b1100_0000, &mut out);

    // Literal field line with literal name: 001NHxxx, N=0, H=0.
    let name = format!("sec-webtransport-http3-draft{version_suffix}");
    prefix_int::encode(name.len() as u64, 3, 0b0010_0000, &mut out);
    out.extend_from_slice(name.as_bytes());
    prefix_int::encode(1, 7, 0x00, &mut out);
    out.push(b'1');

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_block_is_byte_exact() {
        let block = encode_accept_block("02");
        let mut expected = vec![
            0x00, 0x00, // zero prefix
            0xd9, // indexed static 25 (:status 200)
            0x27, 0x17, // literal name, length 30 (3-bit prefix + ext byte)
        ];
        expected.extend_from_slice(b"sec-webtransport-http3-draft02");
        expected.extend_from_slice(&[0x01, b'1']);
        assert_eq!(block, expected);
    }

    #[test]
    fn suffix_is_echoed() {
        let block = encode_accept_block("03");
        let needle = b"sec-webtransport-http3-draft03";
        assert!(block
            .windows(needle.len())
            .any(|window| window == needle));
    }
}
