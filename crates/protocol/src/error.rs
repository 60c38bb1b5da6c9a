//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// Decoding never consumes bytes from an underlying stream, so a
/// `MalformedFrame` only ever invalidates the one message it was raised for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message violates the wire format.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// What was wrong with the message.
        reason: String,
    },
}

impl ProtocolError {
    /// Builds a `MalformedFrame` error from anything printable.
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame {
            reason: reason.into(),
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::malformed(format!("invalid base64 payload: {}", err))
    }
}
