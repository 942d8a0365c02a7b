//! The opening handshake: a single HTTP/1.1 Upgrade exchange.
//!
//! Server side: parse the buffered request, pull out `Sec-WebSocket-Key`,
//! answer with `101 Switching Protocols` carrying the derived
//! `Sec-WebSocket-Accept`. Client side: emit the upgrade request with a
//! random nonce, then verify the accept value on the reply.
//!
//! Both directions operate on the connection's raw read buffer and report
//! how many bytes they consumed, so any frame bytes the peer pipelined
//! behind the handshake stay in the buffer for the frame codec.

use base64::prelude::*;
use sha1::{Digest, Sha1};

/// GUID appended to the key before hashing, fixed by RFC 6455 section 1.3.
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A base64-encoded 16-byte nonce is always 24 characters.
const KEY_LEN: usize = 24;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Derives the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`:
/// `base64(SHA1(key || GUID))`.
pub(crate) fn derive_accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Generates the client handshake nonce: 16 random bytes, base64-encoded.
pub(crate) fn generate_nonce() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Renders the client upgrade request for `endpoint` on `host:port`.
pub(crate) fn request(host: &str, port: u16, endpoint: &str, nonce: &str) -> String {
    format!(
        "GET {endpoint} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {nonce}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Renders the server's `101 Switching Protocols` reply.
pub(crate) fn response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    )
}

/// Result of examining the buffered client request on the server side.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ServerUpgrade {
    /// The header block is not yet complete; keep buffering.
    NeedMore,
    /// A complete header block arrived but no usable key was found. The
    /// connection stays in the handshake state; `consumed` bytes (the whole
    /// input) are discarded.
    NoKey { consumed: usize },
    /// Upgrade accepted: send `response` and consume the header block.
    Accept { response: String, consumed: usize },
}

/// Examines the buffered bytes of an incoming upgrade request.
pub(crate) fn server_upgrade(buf: &[u8]) -> ServerUpgrade {
    let Some(end) = find(buf, HEADER_TERMINATOR) else {
        return ServerUpgrade::NeedMore;
    };
    let header = &buf[..end + HEADER_TERMINATOR.len()];

    match header_value(header, b"Sec-WebSocket-Key:") {
        Some(key) if key.len() == KEY_LEN => ServerUpgrade::Accept {
            response: response(&derive_accept_key(key)),
            consumed: header.len(),
        },
        _ => {
            log::error!("upgrade request carries no usable Sec-WebSocket-Key");
            ServerUpgrade::NoKey { consumed: buf.len() }
        }
    }
}

/// Result of examining the buffered server reply on the client side.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReplyCheck {
    /// The header block is not yet complete; keep buffering.
    NeedMore,
    /// The reply is complete but the accept value is missing or wrong. The
    /// connection stays in the handshake state until the open call times
    /// out; the whole input is discarded.
    Mismatch { consumed: usize },
    /// Accept value verified; consume the header block.
    Ok { consumed: usize },
}

/// Verifies the server's handshake reply against our nonce.
pub(crate) fn check_reply(buf: &[u8], nonce: &str) -> ReplyCheck {
    let Some(end) = find(buf, HEADER_TERMINATOR) else {
        return ReplyCheck::NeedMore;
    };
    let header = &buf[..end + HEADER_TERMINATOR.len()];

    let expected = derive_accept_key(nonce.as_bytes());
    match header_value(header, b"Sec-WebSocket-Accept:") {
        Some(got) if got == expected.as_bytes() => ReplyCheck::Ok {
            consumed: header.len(),
        },
        Some(_) => {
            log::error!("Sec-WebSocket-Accept does not match handshake nonce");
            ReplyCheck::Mismatch { consumed: buf.len() }
        }
        None => {
            log::error!("handshake reply carries no Sec-WebSocket-Accept");
            ReplyCheck::Mismatch { consumed: buf.len() }
        }
    }
}

/// Locates `name` in the header block and returns the value token: leading
/// whitespace skipped, ending at the first non-graphic byte.
fn header_value<'a>(header: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let at = find(header, name)?;
    let rest = &header[at + name.len()..];
    let start = rest.iter().position(|b| b.is_ascii_graphic())?;
    let rest = &rest[start..];
    let end = rest
        .iter()
        .position(|b| !b.is_ascii_graphic())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
