//! # weft
//!
//! A small, embeddable WebSocket library implementing both the server and the
//! client side of [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! over plain TCP.
//!
//! Unlike stream-oriented WebSocket crates, `weft` is event driven: the host
//! supplies a [`Handler`] — a trio of `on_open` / `on_message` / `on_close`
//! callbacks plus an opaque per-connection session value — and the library
//! runs the protocol engine on a dedicated worker thread per connection.
//! Sends are allowed from any thread through the [`Connection`] handle and
//! are serialized at the transport layer.
//!
//! ## Example
//!
//! ```no_run
//! use weft::{Connection, Handler, Message, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Session = ();
//!
//!     fn on_open(&self, _conn: &Connection) -> Self::Session {}
//!
//!     fn on_message(&self, conn: &Connection, _session: &mut Self::Session, msg: Message) {
//!         let _ = conn.send(msg);
//!     }
//!
//!     fn on_close(&self, _conn: &Connection, _session: &mut Self::Session) {}
//! }
//!
//! fn main() -> weft::Result<()> {
//!     let server = Server::open("127.0.0.1", 9001, Echo)?;
//!     // ... accept traffic until shutdown ...
//!     server.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Scope
//!
//! TLS, HTTP routing beyond the single upgrade request, permessage-deflate,
//! and subprotocol negotiation are out of scope. The wire protocol itself —
//! framing, masking, fragmentation, UTF-8 validation, and the close
//! handshake — is implemented in full.

pub mod close;
mod codec;
mod connection;
pub mod frame;
mod handshake;
mod mask;
mod utf8;

mod client;
mod server;

use thiserror::Error;

pub use client::Client;
pub use close::CloseCode;
pub use connection::{Connection, Handler, Options, Role, MAX_PAYLOAD_READ, MAX_READ_BUFFER};
pub use frame::{DataType, Message};
pub use server::Server;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few families:
///
/// - Protocol errors detected while parsing or dispatching frames (reserved
///   bits, bad opcodes, fragmentation violations, masking polarity). These
///   always terminate the connection with close code 1002.
/// - Data validation errors (invalid UTF-8, oversized frames), closing with
///   1007 and 1009 respectively.
/// - Handshake errors, surfaced from `Client::open` and the server upgrade.
/// - Caller errors (sending on a connection that is not open).
/// - Wrapped I/O and URL parsing errors.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A text frame or close-frame reason failed UTF-8 validation.
    /// RFC 6455 requires all text payloads to be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A new text or binary frame arrived while a fragmented message was
    /// still being reassembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A frame's mask bit did not match the connection role: client-to-server
    /// frames must be masked, server-to-client frames must not be.
    #[error("Mask polarity violation")]
    MaskViolation,

    /// Reserved bits in the frame header were set. With no extensions
    /// negotiated they must be zero.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (close, ping, or pong) was received with the FIN bit
    /// clear. Control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A received frame exceeded the configured maximum payload size, or a
    /// reassembled message exceeded the configured buffer limit.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A frame carried an opcode outside the set defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A close frame had an invalid shape, such as a one-byte payload (close
    /// payloads must be empty or carry at least a two-byte code).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code outside the legal set.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// The client upgrade request did not contain a usable
    /// `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The connection did not reach the connected state within the open
    /// deadline. Covers both a slow peer and a handshake reply whose
    /// `Sec-WebSocket-Accept` did not verify.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Attempted an operation on a connection that is not open. Returned by
    /// the send family when the connection has not completed its handshake
    /// or has already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A connect URL used a scheme other than `ws`.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Wraps URL parsing failures from `Client::open_url`.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors from the underlying TCP transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
