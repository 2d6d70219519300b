//! Message model: typed binary messages carried one per frame.

use bytes::Bytes;

use crate::codec::{self, Frame};
use crate::error::NetworkError;

/// A message exchanged between cluster members.
///
/// Each variant maps to one or more wire type tags. Frames whose tag no
/// variant claims decode as [`GossipMessage::Raw`], so observers can skip
/// types they do not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GossipMessage {
    /// An application-defined type tag with an opaque payload.
    Raw(RawMessage),
}

impl GossipMessage {
    /// The wire type tag.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Raw(raw) => raw.message_type,
        }
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Raw(raw) => &raw.buffer,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload().len()
    }

    pub fn as_raw(&self) -> Option<&RawMessage> {
        match self {
            Self::Raw(raw) => Some(raw),
        }
    }

    /// Build the frame carrying this message.
    pub fn to_frame(&self) -> Result<Frame, NetworkError> {
        let message_type = self.message_type();
        if codec::is_reserved(message_type) {
            return Err(NetworkError::Protocol(format!(
                "Message type {message_type:#04x} is reserved"
            )));
        }
        Ok(Frame::new(message_type, self.payload().clone()))
    }

    /// Reconstruct a message from a received application frame.
    pub fn from_frame(frame: Frame) -> Self {
        // No typed variant claims a tag yet; everything arrives as Raw.
        Self::Raw(RawMessage::new(frame.message_type, frame.payload))
    }
}

impl From<RawMessage> for GossipMessage {
    fn from(raw: RawMessage) -> Self {
        Self::Raw(raw)
    }
}

/// A message with an application-chosen type tag and an opaque buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    message_type: u8,
    buffer: Bytes,
}

impl RawMessage {
    pub fn new(message_type: u8, buffer: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            buffer: buffer.into(),
        }
    }

    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Interpret the buffer as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, NetworkError> {
        std::str::from_utf8(&self.buffer)
            .map_err(|e| NetworkError::Protocol(format!("Payload is not UTF-8: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
