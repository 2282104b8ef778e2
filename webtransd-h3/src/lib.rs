//! Server-side WebTransport over HTTP/3 (draft-ietf-webtrans-http3-02).
//!
//! The engine runs on top of a QUIC transport reached through
//! [`webtransd_x::ConnectionHandle`]. For each connection with ALPN `h3`:
//!
//! 1. [`Connection::serve`] exchanges SETTINGS on the control streams and
//!    then classifies every peer-initiated stream: extended-CONNECT
//!    requests are queued for [`Connection::accept_request`], session-bound
//!    streams are routed by their session-ID preamble, and datagrams are
//!    delivered by their quarter-ID prefix.
//! 2. Accepting an [`AcceptRequest`] sends the `200` response block and
//!    yields a [`Session`] keyed by the request stream's ID.
//! 3. The [`Session`] accepts and opens session-bound streams, exchanges
//!    datagrams once the peer registers for them, and ends through the
//!    capsule-framed close protocol on the request stream.
//!
//! The codec layers (`varint`, `frame`, `capsule`) are public for reuse and
//! testing.

pub mod capsule;
pub mod frame;
pub mod varint;

mod config;
mod connection;
mod error;
mod request;
mod session;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{Error, ErrorCode, Result};
pub use request::AcceptRequest;
pub use session::{PeerStream, Session, SessionClose};
