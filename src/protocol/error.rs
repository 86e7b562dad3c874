//! Error types for the facegate frame protocol.

/// Frame encode/decode error.
///
/// Decode errors are never fatal to a connection: the offending frame is
/// dropped and the connection keeps reading.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame too short to carry a tag and a payload
    #[error("Frame too short: {len} byte(s)")]
    TooShort { len: usize },

    /// Tag byte outside the known message types
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),

    /// Payload is not valid MessagePack for the expected shape
    #[error("Payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Payload could not be serialized
    #[error("Payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl CodecError {
    /// Whether the error came from reading a frame (as opposed to building one).
    pub fn is_decode(&self) -> bool {
        !matches!(self, CodecError::Encode(_))
    }
}
