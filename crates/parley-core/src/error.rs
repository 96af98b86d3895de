//! Error types for the Parley wire model.

use thiserror::Error;

/// Core wire-model errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet framing error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Generation window error
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Reorder queue error
    #[error("ring queue error: {0}")]
    Ring(#[from] RingError),

    /// Compression codec error
    #[error("compression error: {0}")]
    Compress(#[from] CompressError),

    /// Voice payload error
    #[error("voice error: {0}")]
    Voice(#[from] VoiceError),
}

/// Packet-framing errors
#[derive(Debug, Error)]
pub enum PacketError {
    /// Datagram too short to hold MAC + header
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Type nibble does not name a packet kind
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidType(u8),

    /// Payload has the wrong length for its kind (e.g. Ack/Pong must be 2 bytes)
    #[error("invalid payload length {actual} for {kind}")]
    InvalidPayloadLength {
        /// Packet kind name
        kind: &'static str,
        /// Actual payload length
        actual: usize,
    },
}

/// Generation-window errors
#[derive(Debug, Error)]
pub enum WindowError {
    /// Advance distance exceeds the id modulus
    #[error("advance of {0} exceeds id modulus")]
    AdvanceTooLarge(u32),
}

/// Reorder-queue errors
#[derive(Debug, Error)]
pub enum RingError {
    /// `set` called for an id that is not in-window-and-unset
    #[error("packet id {0} is not in-window-and-unset")]
    NotSettable(u16),

    /// Index would exceed the configured buffer cap
    #[error("index {index} exceeds buffer cap {cap}")]
    BufferCapExceeded {
        /// Requested logical index
        index: usize,
        /// Configured cap
        cap: usize,
    },

    /// Assembled payload failed to decompress
    #[error("assembled payload: {0}")]
    Decompress(#[from] CompressError),
}

/// Compression codec errors
#[derive(Debug, Error)]
pub enum CompressError {
    /// Input shorter than its own header claims
    #[error("compressed data too short")]
    TooShort,

    /// Only level-1 data is understood
    #[error("unsupported compression level {0}")]
    UnsupportedLevel(u8),

    /// Declared decompressed size exceeds the caller's limit
    #[error("decompressed size {actual} exceeds limit {limit}")]
    SizeLimitExceeded {
        /// Caller-supplied maximum
        limit: usize,
        /// Size the header declares
        actual: usize,
    },

    /// Stream is internally inconsistent
    #[error("corrupt compressed stream: {0}")]
    Corrupt(&'static str),
}

/// Voice payload errors
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Payload too short for the fixed prefix
    #[error("voice payload too short: {0} bytes")]
    TooShort(usize),

    /// Whisper routing table truncated
    #[error("whisper routing truncated")]
    TruncatedRouting,
}
