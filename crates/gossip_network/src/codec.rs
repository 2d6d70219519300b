//! Frame codec: `[type][length][payload]` framing over a byte stream.
//!
//! ```text
//! +-------------+------------------+-------------------+
//! | Type (1B)   | Length (4B BE)   | Payload (N bytes) |
//! +-------------+------------------+-------------------+
//! ```
//!
//! Types `0xF0..=0xFF` are reserved for handshake and control frames; the
//! rest belong to application messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::NetworkError;

/// Size of the frame header (type + length).
pub const HEADER_LEN: usize = 5;

/// First message type reserved for the protocol itself.
pub const RESERVED_TYPE_START: u8 = 0xF0;

/// Reserved frame types.
pub mod frame_type {
    /// Initiator identity and nonce.
    pub const HELLO: u8 = 0xF0;
    /// Responder identity, nonce and proof.
    pub const CHALLENGE: u8 = 0xF1;
    /// Initiator proof.
    pub const PROOF: u8 = 0xF2;
    /// Responder verdict.
    pub const OUTCOME: u8 = 0xF3;
    /// Sender has drained its queue and will write nothing more.
    pub const GOODBYE: u8 = 0xFF;
}

/// Whether a message type belongs to the reserved range.
pub fn is_reserved(message_type: u8) -> bool {
    message_type >= RESERVED_TYPE_START
}

/// One length-delimited, typed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec for encoding and decoding frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom payload limit.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, NetworkError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the header without consuming it.
        let message_type = src[0];
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(NetworkError::Protocol(format!(
                "Frame of {length} bytes exceeds limit of {} bytes",
                self.max_frame_size
            )));
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), NetworkError> {
        let length = frame.payload.len();
        if length > self.max_frame_size {
            return Err(NetworkError::Protocol(format!(
                "Frame of {length} bytes exceeds limit of {} bytes",
                self.max_frame_size
            )));
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_u8(frame.message_type);
        dst.put_u32(length as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
