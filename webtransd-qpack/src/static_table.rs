//! The slice of the RFC 9204 Appendix A static table this decoder acts on.
//!
//! The table has 99 entries (0-98). Only the entries that matter for an
//! extended-CONNECT request are named here; any other valid index is read
//! and ignored by the decoder.

/// Number of entries in the static table; indices at or past this are a
/// decoding error.
pub const TABLE_LEN: u64 = 99;

/// `:authority` (empty value), used as a literal name reference.
pub const AUTHORITY: u64 = 0;

/// `:path: /`. Indexed use supplies the root path; a literal name reference
/// supplies an explicit path.
pub const PATH: u64 = 1;

/// `:method: CONNECT`.
pub const METHOD_CONNECT: u64 = 15;

/// `:method` entries other than CONNECT (DELETE, GET, HEAD, OPTIONS, POST,
/// PUT).
pub const METHOD_OTHER: std::ops::RangeInclusive<u64> = 16..=21;

/// `:scheme: http`.
pub const SCHEME_HTTP: u64 = 22;

/// `:scheme: https`.
pub const SCHEME_HTTPS: u64 = 23;

/// `:status: 200`, used in the accept response block.
pub const STATUS_200: u64 = 25;

/// `origin` (empty value), used as a literal name reference.
pub const ORIGIN: u64 = 90;
