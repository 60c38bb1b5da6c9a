//! # WebShell Protocol Library
//!
//! This crate defines the wire protocol spoken between a browser terminal
//! and the WebShell daemon over a websocket.
//!
//! ## Overview
//!
//! - **Frames**: one tagged unit per websocket message (`Data`, `Resize`,
//!   `Ping`, `Pong`)
//! - **Binary encoding**: the current format, a 1-byte kind followed by the payload
//! - **Legacy text encoding**: base64 terminal input and a raw resize marker,
//!   accepted so older clients keep working
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Session dispatch (daemon)        │
//! ├────────────────────┬────────────────────┤
//! │   Binary decode    │ Legacy text decode │  both yield Frame
//! ├────────────────────┴────────────────────┤
//! │        Websocket message transport      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use webshell_protocol::{Frame, FrameCodec, FrameKind, TerminalSize};
//!
//! let codec = FrameCodec::new();
//!
//! let bytes = codec.encode(&Frame::resize(TerminalSize::new(24, 80))).unwrap();
//! assert_eq!(bytes, vec![0x01, 0x00, 0x18, 0x00, 0x50]);
//!
//! let frame = codec.decode(&[0x00, b'h', b'i']).unwrap();
//! assert_eq!(frame.kind, FrameKind::Data);
//! assert_eq!(frame.payload, b"hi");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame types and the codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameKind, TerminalSize, FRAME_HEADER_SIZE, LEGACY_RESIZE_MARKER,
    RESIZE_PAYLOAD_SIZE,
};
