//! Error types for the RTMFP wire layer

use thiserror::Error;

/// Result type alias for wire-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error types
///
/// Every variant describes a problem with one datagram or one codec call.
/// None of them is fatal to a session: callers drop the offending packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input ended before the structure being decoded
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Cipher input is not a whole number of AES blocks
    #[error("cipher input of {0} bytes is not block aligned")]
    Unaligned(usize),

    /// Packet would exceed the maximum datagram size
    #[error("packet too large: {0} bytes (max {max})", max = crate::MAX_PACKET_SIZE)]
    PacketTooLarge(usize),

    /// Checksum mismatch after decryption (usually a wrong key)
    #[error("invalid checksum: expected 0x{expected:04x}, got 0x{actual:04x}")]
    InvalidChecksum { expected: u16, actual: u16 },

    /// Unknown address type tag
    #[error("invalid address type: 0x{0:02x}")]
    InvalidAddressType(u8),

    /// Malformed chunk
    #[error("invalid chunk 0x{kind:02x}: {reason}")]
    InvalidChunk { kind: u8, reason: String },

    /// Key material rejected
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Generic decode failure
    #[error("decode error: {0}")]
    Decode(String),

    /// AMF0 encoding or decoding error
    #[error("amf error: {0}")]
    Amf(String),

    /// FLV container error
    #[error("flv error: {0}")]
    Flv(String),
}

impl Error {
    /// Shorthand for a truncated-buffer error
    pub fn truncated(needed: usize, have: usize) -> Self {
        Error::BufferTooSmall { needed, have }
    }

    /// Shorthand for a malformed chunk error
    pub fn chunk(kind: u8, reason: impl Into<String>) -> Self {
        Error::InvalidChunk {
            kind,
            reason: reason.into(),
        }
    }
}

/// Ensure `buf` still holds at least `needed` bytes
pub(crate) fn ensure(have: usize, needed: usize) -> Result<()> {
    if have < needed {
        Err(Error::truncated(needed, have))
    } else {
        Ok(())
    }
}
