//! QPACK decoding errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QpackError>;

/// Failure modes of the static-only request decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QpackError {
    /// Header block ended inside an instruction or literal.
    #[error("unexpected end of header block")]
    UnexpectedEof,

    /// Prefixed-integer continuation exceeded 62 bits.
    #[error("prefixed integer overflow")]
    IntegerOverflow,

    /// The block prefix declared a non-zero required insert count or base.
    #[error("non-zero field section prefix (no QPACK dynamic table)")]
    NonZeroPrefix,

    /// Instruction references the dynamic table (indexed dynamic,
    /// post-base, or a dynamic name reference).
    #[error("dynamic table reference (no QPACK dynamic table)")]
    NoDynamicTable,

    /// Static table index past the end of the table.
    #[error("invalid static table index {0}")]
    InvalidStaticIndex(u64),

    /// Literal longer than the 8 192-byte wire cap, or Huffman output
    /// longer than the 1 024-byte decode cap.
    #[error("header field too large")]
    FieldTooLarge,

    /// Malformed Huffman-coded string.
    #[error("huffman decoding failed: {0}")]
    Huffman(&'static str),

    /// Literal string is not valid UTF-8.
    #[error("header field is not valid UTF-8")]
    InvalidUtf8,

    /// A `:method` other than CONNECT.
    #[error("':method' must be CONNECT")]
    MethodNotConnect,

    /// `:scheme` was `http` (or anything other than `https`).
    #[error("':scheme' must be https")]
    SchemeNotHttps,

    /// `:protocol` carried a value other than `webtransport`.
    #[error("':protocol' must be 'webtransport'")]
    ProtocolNotWebTransport,

    /// The extended-CONNECT acceptance predicate failed.
    #[error("incomplete CONNECT request: missing {0}")]
    MissingField(&'static str),
}
