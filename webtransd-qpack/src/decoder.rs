//! Static-only request decoder for extended-CONNECT header blocks.

use crate::error::{QpackError, Result};
use crate::huffman;
use crate::prefix_int;
use crate::static_table;

/// Wire cap on a literal string's declared length.
const MAX_LITERAL_LEN: u64 = 8192;

/// Cap on the decoded size of a Huffman-coded literal.
const MAX_HUFFMAN_DECODED: usize = 1024;

/// Header names the engine matches literally.
const PROTOCOL: &[u8] = b":protocol";
const WEBTRANSPORT: &[u8] = b"webtransport";
const DRAFT_PREFIX: &[u8] = b"sec-webtransport-http3-draft";

/// The pseudo-headers of an accepted extended-CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHeaders {
    pub authority: String,
    pub path: String,
    pub origin: String,
    /// Draft suffix from `sec-webtransport-http3-draft<suffix>: 1`; when the
    /// client offers several, the lexicographically greatest wins.
    pub version: String,
}

/// Decode a complete header block into CONNECT pseudo-headers, enforcing the
/// WebTransport acceptance predicate:
/// `:method = CONNECT`, `:scheme = https`, `:protocol = webtransport`,
/// non-empty authority/path/origin, and at least one offered draft version.
pub fn decode_connect(block: &[u8]) -> Result<ConnectHeaders> {
    // Required insert count and delta base must both be zero: one byte each
    // since zero fits any prefix.
    if block.len() < 2 {
        return Err(QpackError::UnexpectedEof);
    }
    if block[0] != 0 || block[1] != 0 {
        return Err(QpackError::NonZeroPrefix);
    }
    let mut pos = 2usize;

    let mut method_connect = false;
    let mut scheme_https = false;
    let mut protocol_webtransport = false;
    let mut authority: Option<String> = None;
    let mut path: Option<String> = None;
    let mut origin: Option<String> = None;
    let mut version: Option<String> = None;

    while pos < block.len() {
        let first = block[pos];

        if first & 0b1000_0000 != 0 {
            // Indexed field line: 1Txxxxxx, T=1 for static.
            if first & 0b0100_0000 == 0 {
                return Err(QpackError::NoDynamicTable);
            }
            let (index, consumed) = prefix_int::decode(&block[pos..], 6)?;
            pos += consumed;
            match index {
                static_table::PATH => path = Some("/".to_owned()),
                static_table::METHOD_CONNECT => method_connect = true,
                static_table::SCHEME_HTTP => return Err(QpackError::SchemeNotHttps),
                static_table::SCHEME_HTTPS => scheme_https = true,
                index if static_table::METHOD_OTHER.contains(&index) => {
                    return Err(QpackError::MethodNotConnect);
                }
                index if index < static_table::TABLE_LEN => {}
                index => return Err(QpackError::InvalidStaticIndex(index)),
            }
        } else if first & 0b1100_0000 == 0b0100_0000 {
            // Literal field line with name reference: 01NTxxxx, T=1 for static.
            if first & 0b0001_0000 == 0 {
                return Err(QpackError::NoDynamicTable);
            }
            let (index, consumed) = prefix_int::decode(&block[pos..], 4)?;
            pos += consumed;
            let value = read_string(block, &mut pos, 7)?;
            match index {
                static_table::AUTHORITY => authority = Some(into_utf8(value)?),
                static_table::PATH => path = Some(into_utf8(value)?),
                static_table::ORIGIN => origin = Some(into_utf8(value)?),
                index if index < static_table::TABLE_LEN => {}
                index => return Err(QpackError::InvalidStaticIndex(index)),
            }
        } else if first & 0b1110_0000 == 0b0010_0000 {
            // Literal field line with literal name: 001NHxxx.
            let name_huffman = first & 0b0000_1000 != 0;
            let name = read_literal(block, &mut pos, 3, name_huffman)?;
            let value = read_string(block, &mut pos, 7)?;

            if name == PROTOCOL {
                if value != WEBTRANSPORT {
                    return Err(QpackError::ProtocolNotWebTransport);
                }
                protocol_webtransport = true;
            } else if name.starts_with(DRAFT_PREFIX) && value == b"1" {
                let suffix = into_utf8(name[DRAFT_PREFIX.len()..].to_vec())?;
                if version.as_deref().map_or(true, |chosen| suffix.as_str() > chosen) {
                    version = Some(suffix);
                }
            }
            // Other literal-named fields are ignored.
        } else {
            // Post-base forms (0001xxxx / 0000xxxx) need a dynamic table.
            return Err(QpackError::NoDynamicTable);
        }
    }

    if !method_connect {
        return Err(QpackError::MissingField(":method"));
    }
    if !scheme_https {
        return Err(QpackError::MissingField(":scheme"));
    }
    if !protocol_webtransport {
        return Err(QpackError::MissingField(":protocol"));
    }
    let authority = authority.ok_or(QpackError::MissingField(":authority"))?;
    let path = path.ok_or(QpackError::MissingField(":path"))?;
    let origin = origin.ok_or(QpackError::MissingField(":origin"))?;
    let version =
        version.ok_or(QpackError::MissingField("sec-webtransport-http3-draft"))?;

    Ok(ConnectHeaders {
        authority,
        path,
        origin,
        version,
    })
}

/// Read a length-prefixed string whose Huffman bit sits just above an
/// `prefix_bits`-bit length in the current byte.
fn read_string(block: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<Vec<u8>> {
    let Some(&first) = block.get(*pos) else {
        return Err(QpackError::UnexpectedEof);
    };
    let huffman = first & (1 << prefix_bits) != 0;
    read_literal(block, pos, prefix_bits, huffman)
}

/// Read `prefix_bits`-prefixed length plus that many bytes, decoding Huffman
/// when flagged.
fn read_literal(
    block: &[u8],
    pos: &mut usize,
    prefix_bits: u8,
    huffman: bool,
) -> Result<Vec<u8>> {
    let (len, consumed) = prefix_int::decode(&block[*pos..], prefix_bits)?;
    *pos += consumed;
    if len > MAX_LITERAL_LEN {
        return Err(QpackError::FieldTooLarge);
    }
    let len = len as usize;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= block.len())
        .ok_or(QpackError::UnexpectedEof)?;
    let raw = &block[*pos..end];
    *pos = end;
    if huffman {
        huffman::decode(raw, MAX_HUFFMAN_DECODED)
    } else {
        Ok(raw.to_vec())
    }
}

fn into_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| QpackError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BlockBuilder {
        out: Vec<u8>,
    }

    impl BlockBuilder {
        fn new() -> Self {
            BlockBuilder {
                out: vec![0x00, 0x00],
            }
        }

        fn indexed(mut self, index: u64) -> Self {
            prefix_int::encode(index, 6, 0b1100_0000, &mut self.out);
            self
        }

        fn name_ref(mut self, index: u64, value: &[u8]) -> Self {
            prefix_int::encode(index, 4, 0b0101_0000, &mut self.out);
            prefix_int::encode(value.len() as u64, 7, 0x00, &mut self.out);
            self.out.extend_from_slice(value);
            self
        }

        fn literal(mut self, name: &[u8], value: &[u8]) -> Self {
            prefix_int::encode(name.len() as u64, 3, 0b0010_0000, &mut self.out);
            self.out.extend_from_slice(name);
            prefix_int::encode(value.len() as u64, 7, 0x00, &mut self.out);
            self.out.extend_from_slice(value);
            self
        }

        fn build(self) -> Vec<u8> {
            self.out
        }
    }

    fn connect_block() -> BlockBuilder {
        BlockBuilder::new()
            .indexed(static_table::METHOD_CONNECT)
            .indexed(static_table::SCHEME_HTTPS)
            .name_ref(static_table::AUTHORITY, b"example:4433")
            .name_ref(static_table::PATH, b"/test")
            .name_ref(static_table::ORIGIN, b"https://example")
            .literal(b":protocol", b"webtransport")
            .literal(b"sec-webtransport-http3-draft02", b"1")
    }

    #[test]
    fn decodes_full_connect_request() {
        let headers = decode_connect(&connect_block().build()).unwrap();
        assert_eq!(headers.authority, "example:4433");
        assert_eq!(headers.path, "/test");
        assert_eq!(headers.origin, "https://example");
        assert_eq!(headers.version, "02");
    }

    #[test]
    fn indexed_root_path_accepted() {
        let block = BlockBuilder::new()
            .indexed(static_table::METHOD_CONNECT)
            .indexed(static_table::SCHEME_HTTPS)
            .indexed(static_table::PATH)
            .name_ref(static_table::AUTHORITY, b"example")
            .name_ref(static_table::ORIGIN, b"https://example")
            .literal(b":protocol", b"webtransport")
            .literal(b"sec-webtransport-http3-draft02", b"1")
            .build();
        let headers = decode_connect(&block).unwrap();
        assert_eq!(headers.path, "/");
    }

    #[test]
    fn greatest_draft_version_wins() {
        let block = connect_block()
            .literal(b"sec-webtransport-http3-draft01", b"1")
            .literal(b"sec-webtransport-http3-draft03", b"1")
            .build();
        let headers = decode_connect(&block).unwrap();
        assert_eq!(headers.version, "03");
    }

    #[test]
    fn huffman_literal_value() {
        // ":protocol: webtransport" with a Huffman-coded value, surrounded
        // by the rest of a valid request.
        let mut block = BlockBuilder::new()
            .indexed(static_table::METHOD_CONNECT)
            .indexed(static_table::SCHEME_HTTPS)
            .name_ref(static_table::AUTHORITY, b"example")
            .name_ref(static_table::PATH, b"/")
            .name_ref(static_table::ORIGIN, b"https://example")
            .literal(b"sec-webtransport-http3-draft02", b"1")
            .build();
        // Hand-built literal field line with literal name ":protocol",
        // Huffman value. Encoded "webtransport" via the shared table.
        let value = huffman_encode(b"webtransport");
        prefix_int::encode(9, 3, 0b0010_0000, &mut block);
        block.extend_from_slice(b":protocol");
        prefix_int::encode(value.len() as u64, 7, 0x80, &mut block);
        block.extend_from_slice(&value);
        let headers = decode_connect(&block).unwrap();
        assert_eq!(headers.version, "02");
    }

    fn huffman_encode(input: &[u8]) -> Vec<u8> {
        // Tiny local encoder mirroring huffman::tests::encode.
        let mut out = Vec::new();
        let mut acc: u64 = 0;
        let mut acc_bits = 0u32;
        for &byte in input {
            let (code, bits) = crate::huffman::CODES[byte as usize];
            acc = (acc << bits) | u64::from(code);
            acc_bits += u32::from(bits);
            while acc_bits >= 8 {
                acc_bits -= 8;
                out.push((acc >> acc_bits) as u8);
            }
        }
        if acc_bits > 0 {
            out.push(((acc << (8 - acc_bits)) as u8) | ((1 << (8 - acc_bits)) - 1));
        }
        out
    }

    #[test]
    fn wrong_method_rejected() {
        let block = BlockBuilder::new().indexed(17).build(); // :method GET
        assert_eq!(decode_connect(&block), Err(QpackError::MethodNotConnect));
    }

    #[test]
    fn plain_http_scheme_rejected() {
        let block = BlockBuilder::new()
            .indexed(static_table::METHOD_CONNECT)
            .indexed(static_table::SCHEME_HTTP)
            .build();
        assert_eq!(decode_connect(&block), Err(QpackError::SchemeNotHttps));
    }

    #[test]
    fn wrong_protocol_rejected() {
        let block = connect_block().literal(b":protocol", b"masque").build();
        assert_eq!(
            decode_connect(&block),
            Err(QpackError::ProtocolNotWebTransport)
        );
    }

    #[test]
    fn dynamic_table_reference_rejected() {
        // Indexed field line with T=0 (dynamic).
        let block = vec![0x00, 0x00, 0b1000_0001];
        assert_eq!(decode_connect(&block), Err(QpackError::NoDynamicTable));
        // Post-base indexed.
        let block = vec![0x00, 0x00, 0b0001_0001];
        assert_eq!(decode_connect(&block), Err(QpackError::NoDynamicTable));
    }

    #[test]
    fn nonzero_prefix_rejected() {
        assert_eq!(
            decode_connect(&[0x01, 0x00]),
            Err(QpackError::NonZeroPrefix)
        );
        assert_eq!(decode_connect(&[0x00]), Err(QpackError::UnexpectedEof));
    }

    #[test]
    fn oversized_literal_rejected() {
        let mut block = vec![0x00, 0x00];
        // Literal name of declared length 9000.
        prefix_int::encode(9000, 3, 0b0010_0000, &mut block);
        assert_eq!(decode_connect(&block), Err(QpackError::FieldTooLarge));
    }

    #[test]
    fn truncated_literal_rejected() {
        let block = connect_block().build();
        assert_eq!(
            decode_connect(&block[..block.len() - 3]),
            Err(QpackError::UnexpectedEof)
        );
    }

    #[test]
    fn missing_fields_reported() {
        let block = BlockBuilder::new()
            .indexed(static_table::METHOD_CONNECT)
            .indexed(static_table::SCHEME_HTTPS)
            .literal(b":protocol", b"webtransport")
            .literal(b"sec-webtransport-http3-draft02", b"1")
            .build();
        assert_eq!(
            decode_connect(&block),
            Err(QpackError::MissingField(":authority"))
        );
    }

    #[test]
    fn unrecognized_static_entries_ignored() {
        let block = connect_block()
            .indexed(6) // date
            .name_ref(92, b"quiche") // server
            .literal(b"x-custom", b"yes")
            .build();
        assert!(decode_connect(&block).is_ok());
    }

    #[test]
    fn out_of_table_index_rejected() {
        let block = BlockBuilder::new().indexed(150).build();
        assert_eq!(
            decode_connect(&block),
            Err(QpackError::InvalidStaticIndex(150))
        );
    }
}
