//! Frame codec for the terminal wire protocol.
//!
//! # Frame Format
//!
//! Every transport message carries exactly one frame:
//! - 1 byte: frame kind
//! - N bytes: payload
//!
//! There is no length prefix; the transport (websocket messages) is already
//! message-delimited.
//!
//! | Kind   | Byte   | Payload                                  |
//! |--------|--------|------------------------------------------|
//! | Data   | `0x00` | raw terminal bytes                       |
//! | Resize | `0x01` | rows (u16 BE), cols (u16 BE)             |
//! | Ping   | `0x02` | none                                     |
//! | Pong   | `0x03` | none                                     |
//!
//! # Legacy Text Encoding
//!
//! Older clients send text messages instead. A text message starting with the
//! byte `0x01` is a resize `[0x01, rows_hi, rows_lo, cols_hi, cols_lo]`; any
//! other text message is base64-encoded terminal input. Both entry points
//! produce the same [`Frame`] so dispatch is written once.
//!
//! The resize marker is checked on the raw message before any base64
//! decoding. A legacy message that starts with `0x01` is always treated as a
//! resize; the old encoding has no way to mark it as data, and that is kept
//! as is for compatibility.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{ProtocolError, Result};

/// Size of the frame kind tag.
pub const FRAME_HEADER_SIZE: usize = 1;

/// Exact payload length of a resize frame.
pub const RESIZE_PAYLOAD_SIZE: usize = 4;

/// Marker byte that introduces a resize in the legacy text encoding.
pub const LEGACY_RESIZE_MARKER: u8 = 0x01;

/// Discriminant of a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Terminal bytes, passed through untouched.
    Data = 0x00,
    /// Terminal geometry change.
    Resize = 0x01,
    /// Liveness probe; answered with `Pong`.
    Ping = 0x02,
    /// Reply to `Ping`.
    Pong = 0x03,
}

impl FrameKind {
    /// Returns the wire tag.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(FrameKind::Data),
            0x01 => Ok(FrameKind::Resize),
            0x02 => Ok(FrameKind::Ping),
            0x03 => Ok(FrameKind::Pong),
            other => Err(ProtocolError::malformed(format!(
                "unknown frame kind 0x{:02x}",
                other
            ))),
        }
    }
}

/// Terminal geometry carried by a resize frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Encode as the 4-byte resize payload.
    pub fn to_bytes(self) -> [u8; RESIZE_PAYLOAD_SIZE] {
        let rows = self.rows.to_be_bytes();
        let cols = self.cols.to_be_bytes();
        [rows[0], rows[1], cols[0], cols[1]]
    }

    /// Decode from the first 4 bytes of a resize payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESIZE_PAYLOAD_SIZE {
            return Err(ProtocolError::malformed(format!(
                "resize payload needs {} bytes, have {}",
                RESIZE_PAYLOAD_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            rows: u16::from_be_bytes([bytes[0], bytes[1]]),
            cols: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// A single protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the frame means.
    pub kind: FrameKind,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from its parts.
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// A data frame carrying terminal bytes.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Data, payload.into())
    }

    /// A resize frame.
    pub fn resize(size: TerminalSize) -> Self {
        Self::new(FrameKind::Resize, size.to_bytes().to_vec())
    }

    /// A ping frame.
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Vec::new())
    }

    /// A pong frame.
    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Vec::new())
    }

    /// Returns the geometry of a resize frame, `None` for any other kind.
    pub fn terminal_size(&self) -> Option<TerminalSize> {
        match self.kind {
            FrameKind::Resize => TerminalSize::from_bytes(&self.payload).ok(),
            _ => None,
        }
    }

    /// Size of this frame once encoded.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Encoder and decoder for frames.
///
/// Stateless; all methods are pure transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    ///
    /// Fails if the payload breaks the invariant of its kind: resize frames
    /// carry exactly 4 bytes, ping and pong carry none.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(frame.encoded_len());
        self.encode_into(frame, &mut output)?;
        Ok(output)
    }

    /// Encode a frame, appending to `output`.
    pub fn encode_into(&self, frame: &Frame, output: &mut Vec<u8>) -> Result<()> {
        match frame.kind {
            FrameKind::Resize if frame.payload.len() != RESIZE_PAYLOAD_SIZE => {
                return Err(ProtocolError::malformed(format!(
                    "resize payload must be {} bytes, got {}",
                    RESIZE_PAYLOAD_SIZE,
                    frame.payload.len()
                )));
            }
            FrameKind::Ping | FrameKind::Pong if !frame.payload.is_empty() => {
                return Err(ProtocolError::malformed(format!(
                    "{:?} frame must not carry a payload",
                    frame.kind
                )));
            }
            _ => {}
        }

        output.reserve(frame.encoded_len());
        output.push(frame.kind.as_byte());
        output.extend_from_slice(&frame.payload);
        Ok(())
    }

    /// Decode a binary message into a frame.
    ///
    /// Resize payloads longer than 4 bytes are truncated to 4; trailing bytes
    /// after a ping or pong are ignored.
    pub fn decode(&self, data: &[u8]) -> Result<Frame> {
        let (&tag, payload) = data
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty message"))?;

        let kind = FrameKind::from_byte(tag)?;
        let frame = match kind {
            FrameKind::Data => Frame::data(payload),
            FrameKind::Resize => Frame::resize(TerminalSize::from_bytes(payload)?),
            FrameKind::Ping => Frame::ping(),
            FrameKind::Pong => Frame::pong(),
        };

        Ok(frame)
    }

    /// Decode a legacy text message into a frame.
    ///
    /// Takes raw bytes so the caller does not have to care whether the
    /// transport validated them as UTF-8.
    pub fn decode_legacy_text(&self, data: &[u8]) -> Result<Frame> {
        match data.first() {
            None => Err(ProtocolError::malformed("empty text message")),
            Some(&LEGACY_RESIZE_MARKER) => {
                let size = TerminalSize::from_bytes(&data[1..])?;
                Ok(Frame::resize(size))
            }
            Some(_) => {
                let decoded = BASE64.decode(data)?;
                Ok(Frame::data(decoded))
            }
        }
    }

    /// Encode terminal bytes the way a legacy client sends them.
    pub fn encode_legacy_data(&self, payload: &[u8]) -> String {
        BASE64.encode(payload)
    }

    /// Encode a resize the way a legacy client sends it.
    pub fn encode_legacy_resize(&self, size: TerminalSize) -> Vec<u8> {
        let mut output = Vec::with_capacity(1 + RESIZE_PAYLOAD_SIZE);
        output.push(LEGACY_RESIZE_MARKER);
        output.extend_from_slice(&size.to_bytes());
        output
    }
}
