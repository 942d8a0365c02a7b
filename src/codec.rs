//! Incremental WebSocket frame decoding and encoding.
//!
//! The [`Decoder`] is a two-phase state machine (header, then payload) over a
//! growable byte buffer. It is deliberately transport-agnostic: the
//! connection worker appends whatever bytes the socket produced and calls
//! [`Decoder::decode`] in a loop. Three outcomes are possible per call:
//!
//! - `Ok(Some(frame))` — a complete frame was consumed from the buffer; its
//!   payload is already unmasked.
//! - `Ok(None)` — the buffer holds a truncated frame; more bytes are needed.
//! - `Err(..)` — the input violates the protocol (reserved bits, unknown
//!   opcode, malformed control frame, oversized payload). The caller is
//!   expected to fail the connection.
//!
//! The [`Encoder`] performs the inverse, writing a header plus the payload
//! (masked on the way out when the frame carries a key).

use bytes::{Buf, BytesMut};

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    Result, WebSocketError,
};

/// Parsed fixed-size portion of a frame header.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Number of extended-length bytes still to read (0, 2, or 8).
    extra: usize,
    /// The raw 7-bit length code.
    length_code: u8,
    /// Bytes remaining after the first two: extended length plus mask key.
    header_size: usize,
}

/// Header fields plus masking key, waiting on the payload bytes.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

enum ReadState {
    Header(Header),
    Payload(HeaderAndMask),
}

/// Stateful frame decoder.
///
/// Holds its position across calls so a frame may arrive in arbitrarily
/// small pieces. `max_payload_size` bounds a single frame's payload; larger
/// frames are rejected with [`WebSocketError::FrameTooLarge`].
pub(crate) struct Decoder {
    state: Option<ReadState>,
    max_payload_size: usize,
}

impl Decoder {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }

    /// Whether the decoder sits in the middle of a frame, i.e. it has
    /// consumed part of a header or is waiting on payload bytes.
    pub fn is_mid_frame(&self) -> bool {
        self.state.is_some()
    }

    /// Drops any partially decoded frame, returning the decoder to its
    /// between-frames state. Used when an incomplete message is abandoned.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Attempts to decode one frame from `src`.
    ///
    /// Consumed bytes are removed from `src`. On `Ok(None)` nothing beyond
    /// the already-parsed header prefix has been consumed and the caller
    /// should retry once more bytes arrive.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;

                    // No extensions are negotiated, so all three reserved
                    // bits must be clear.
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::FrameTooLarge),
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mask = header_and_mask.mask;

                    let mut payload = src.split_to(header_and_mask.payload_len);
                    if let Some(key) = mask {
                        apply_mask(&mut payload, key);
                    }

                    // The key is kept on the frame so the dispatcher can
                    // check masking polarity against the connection role.
                    break Ok(Some(Frame::new(header.fin, header.opcode, mask, payload)));
                }
            }
        }
    }
}

/// Frame encoder: serializes a [`Frame`] into an output buffer.
pub(crate) struct Encoder;

impl Encoder {
    /// Appends the encoded frame to `dst`, masking the payload when the
    /// frame carries a masking key.
    pub fn encode(mut frame: Frame, dst: &mut BytesMut) {
        if frame.is_masked() {
            frame.mask();
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);
    }
}
